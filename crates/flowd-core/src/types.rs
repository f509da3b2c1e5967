use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::FlowdError;
use crate::trigger::Trigger;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Unique flow identifier.
    FlowId
);
entity_id!(
    /// Unique run identifier.
    RunId
);
entity_id!(
    /// Unique node identifier.
    NodeId
);
entity_id!(ThreadId);

/// Shared status vocabulary of runs and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    AskUserForInput,
    Completed,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AskUserForInput => "ask_user_for_input",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = FlowdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "ask_user_for_input" => Ok(Self::AskUserForInput),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(FlowdError::InvalidArgument(format!("unknown status '{}'", other))),
        }
    }
}

/// Lifecycle status of a flow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Active,
    Inactive,
    Error,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowStatus {
    type Err = FlowdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            other => Err(FlowdError::InvalidArgument(format!(
                "unknown flow status '{}'",
                other
            ))),
        }
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::with_role(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text)
    }

    fn with_role(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Free-form flow metadata. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    #[serde(default)]
    pub agent_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readable_description_of_triggers: Option<String>,
    /// Archived flows are hidden and never armed; the row is kept.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub archived: bool,
    /// Set on flows generated by another flow; hidden from listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_flow_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A persisted, triggerable task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub account_id: String,
    pub user_id: String,
    pub readable_name: String,
    pub readable_description: String,
    pub task: String,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub metadata: FlowMetadata,
    pub status: FlowStatus,
    #[serde(default)]
    pub previous_status: Option<FlowStatus>,
    /// Indexes of one-shot triggers that already produced a run.
    #[serde(default)]
    pub spent_triggers: BTreeSet<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(
        account_id: impl Into<String>,
        user_id: impl Into<String>,
        task: impl Into<String>,
        triggers: Vec<Trigger>,
    ) -> Self {
        let now = Utc::now();
        let triggers = if triggers.is_empty() {
            vec![Trigger::immediate()]
        } else {
            triggers
        };
        Self {
            id: FlowId::new(),
            account_id: account_id.into(),
            user_id: user_id.into(),
            readable_name: "Flow".to_string(),
            readable_description: "Flow".to_string(),
            task: task.into(),
            triggers,
            metadata: FlowMetadata::default(),
            status: FlowStatus::Active,
            previous_status: None,
            spent_triggers: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the scheduler may create runs for this flow.
    pub fn is_schedulable(&self) -> bool {
        self.status == FlowStatus::Active && !self.metadata.archived
    }
}

/// Records which trigger produced a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerInput {
    pub index: usize,
    pub trigger: Trigger,
    pub fired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Whether an input wait is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStatus {
    Pending,
    Completed,
}

/// A pending (or answered) request for human input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputWait {
    pub id: String,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: WaitStatus,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub prompt: Map<String, Value>,
}

impl InputWait {
    pub fn is_pending(&self) -> bool {
        self.status == WaitStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunPrivateData {
    /// The live node. A relation only; the node row is owned by the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_on_node_id: Option<NodeId>,
}

/// One execution attempt of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub flow_id: FlowId,
    pub account_id: String,
    pub input: String,
    #[serde(default)]
    pub trigger_input: Option<TriggerInput>,
    pub status: Status,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub input_wait: Option<InputWait>,
    #[serde(default)]
    pub private_data: RunPrivateData,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub structured_output: Map<String, Value>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(flow: &Flow, trigger_input: Option<TriggerInput>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            flow_id: flow.id.clone(),
            account_id: flow.account_id.clone(),
            input: flow.task.clone(),
            trigger_input,
            status: Status::Queued,
            live_status: None,
            input_wait: None,
            private_data: RunPrivateData::default(),
            output: None,
            structured_output: Map::new(),
            reasoning: None,
            error: None,
            conversation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One step inside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub run_id: RunId,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    pub status: Status,
    #[serde(default)]
    pub live_status: Option<String>,
    #[serde(default)]
    pub input_wait: Option<InputWait>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A node starts live: it is created the moment the run begins working on it.
    pub fn new(run_id: RunId, name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            run_id,
            name: name.into(),
            input,
            status: Status::Running,
            live_status: None,
            input_wait: None,
            output: None,
            error: None,
            conversation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A parallel execution lane, kept for visualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub run_id: RunId,
    pub name: String,
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(run_id: RunId, name: impl Into<String>) -> Self {
        Self {
            id: ThreadId::new(),
            run_id,
            name: name.into(),
            node_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Message log segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    User,
    Debug,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Debug => "debug",
        }
    }
}

impl FromStr for Segment {
    type Err = FlowdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            // "agent" is the public name of the debug segment.
            "debug" | "agent" => Ok(Self::Debug),
            other => Err(FlowdError::InvalidArgument(format!("unknown segment '{}'", other))),
        }
    }
}

/// A batch of messages appended to a flow's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub id: i64,
    pub flow_id: FlowId,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub segment: Segment,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

/// A time-bounded listing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// Strictly older than the timestamp, newest first.
    Before(DateTime<Utc>),
    /// Strictly newer than the timestamp, oldest first.
    After(DateTime<Utc>),
}

/// Upper bound on every listing.
pub const MAX_PAGE_SIZE: usize = 50;

/// Clamp a caller-supplied limit into `1..=MAX_PAGE_SIZE`; zero means the maximum.
pub fn clamp_limit(limit: usize) -> usize {
    if limit == 0 {
        MAX_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// 1-based page request. Only built through [`PageRequest::new`], which
/// keeps the page number at least 1 and the size within `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page_number: usize,
    page_size: usize,
    sort: SortOrder,
}

impl PageRequest {
    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            sort: SortOrder::Desc,
        }
    }

    pub fn sorted(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn sort(&self) -> SortOrder {
        self.sort
    }

    /// Row offset, saturating for page numbers past any real result set.
    pub fn offset(&self) -> usize {
        self.page_number.saturating_sub(1).saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page_size: usize,
    pub page_number: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: usize, request: PageRequest) -> Self {
        Self {
            items,
            total_count,
            page_size: request.page_size,
            page_number: request.page_number,
            total_pages: total_count.div_ceil(request.page_size.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::AskUserForInput).unwrap(),
            "\"ask_user_for_input\""
        );
        assert_eq!("ask_user_for_input".parse::<Status>().unwrap(), Status::AskUserForInput);
        assert!("paused".parse::<Status>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::AskUserForInput.is_terminal());
    }

    #[test]
    fn input_wait_flattens_prompt_fields() {
        let mut prompt = Map::new();
        prompt.insert("question".into(), Value::String("Which repo?".into()));
        let wait = InputWait {
            id: "w1".into(),
            run_id: RunId::from_string("r1"),
            node_id: Some(NodeId::from_string("n1")),
            status: WaitStatus::Pending,
            created_at: Utc::now(),
            prompt,
        };
        let json = serde_json::to_value(&wait).unwrap();
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["question"], "Which repo?");
        assert_eq!(json["status"], "pending");

        let back: InputWait = serde_json::from_value(json).unwrap();
        assert_eq!(back, wait);
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let json = serde_json::json!({
            "agentCodes": ["DEEPRESEARCH_AGENT"],
            "archived": true,
            "mandatoryColumns": [],
        });
        let meta: FlowMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.agent_codes, vec!["DEEPRESEARCH_AGENT"]);
        assert!(meta.archived);
        assert!(meta.extra.contains_key("mandatoryColumns"));
    }

    #[test]
    fn empty_trigger_list_gets_default() {
        let flow = Flow::new("acct", "user", "say hi", vec![]);
        assert_eq!(flow.triggers, vec![Trigger::immediate()]);
        assert!(flow.is_schedulable());
    }

    #[test]
    fn archived_flow_is_not_schedulable() {
        let mut flow = Flow::new("acct", "user", "say hi", vec![]);
        flow.metadata.archived = true;
        assert!(!flow.is_schedulable());
    }

    #[test]
    fn segment_aliases() {
        assert_eq!("agent".parse::<Segment>().unwrap(), Segment::Debug);
        assert_eq!("user".parse::<Segment>().unwrap(), Segment::User);
    }

    #[test]
    fn page_math() {
        let req = PageRequest::new(0, 500);
        assert_eq!(req.page_number(), 1);
        assert_eq!(req.page_size(), MAX_PAGE_SIZE);
        assert_eq!(req.offset(), 0);
        assert_eq!(PageRequest::new(1, 0).page_size(), 1);
        let page = Page::new(vec![1, 2], 101, PageRequest::new(3, 50));
        assert_eq!(page.total_pages, 3);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
        assert_eq!(clamp_limit(0), 50);
        assert_eq!(clamp_limit(7), 7);
    }

    #[test]
    fn huge_page_numbers_saturate() {
        let req = PageRequest::new(usize::MAX, MAX_PAGE_SIZE);
        assert_eq!(req.offset(), usize::MAX);
        let page: Page<u8> = Page::new(vec![], 10, req);
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.page_number, usize::MAX);
    }
}
