use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use flowd_core::call::{CallMetadata, CorrelationKey};
use flowd_core::config::EnsembleConfig;
use flowd_core::error::{FlowdError, Result};
use flowd_core::traits::FlowStore;
use flowd_core::trigger::{parse_triggers, Trigger};
use flowd_core::types::{ChatMessage, Flow};
use flowd_llm::{Ensemble, EnsembleRequest, ResponseShape};

const CORRELATION_KEY: &str = "generator";
const USECASE: &str = "generator";
const FALLBACK_NAME: &str = "Flow";

/// Input for creating a flow from a natural-language task.
#[derive(Debug, Clone, Default)]
pub struct GenerateFlowRequest {
    pub account_id: String,
    pub user_id: String,
    /// The user's own description of the task.
    pub init_message: String,
    pub agent_codes: Vec<String>,
    /// Event ids the chosen agents can emit, offered for `event.*` triggers.
    pub available_events: Vec<String>,
    /// Offset of the user's clock from UTC.
    pub timezone_offset_secs: i64,
}

#[derive(Debug, Deserialize)]
struct Naming {
    #[serde(default)]
    readable_name: Option<String>,
    #[serde(default)]
    readable_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerPlan {
    #[serde(default)]
    readable_description_of_triggers: Option<String>,
    triggers: Vec<String>,
}

/// Creates flows from a task description with two ensemble calls.
///
/// Both calls are tagged with one fresh correlation key. Once the flow row
/// exists its id is merged into the metadata of every attempt of both calls.
pub struct FlowGenerator {
    ensemble: Arc<Ensemble>,
    store: Arc<dyn FlowStore>,
    config: EnsembleConfig,
}

impl FlowGenerator {
    pub fn new(ensemble: Arc<Ensemble>, store: Arc<dyn FlowStore>, config: EnsembleConfig) -> Self {
        Self {
            ensemble,
            store,
            config,
        }
    }

    /// Name the task, infer its triggers, and store it as an active flow.
    ///
    /// The caller is responsible for arming the returned flow.
    pub async fn generate(&self, request: &GenerateFlowRequest) -> Result<Flow> {
        if request.init_message.trim().is_empty() {
            return Err(FlowdError::InvalidArgument("task description is empty".into()));
        }

        let correlation = CorrelationKey::generate(CORRELATION_KEY);
        let metadata =
            CallMetadata::new(correlation.clone(), USECASE).with_account(&request.account_id);

        let (naming, _) = self
            .ensemble
            .call_typed::<Naming>(
                EnsembleRequest::new(
                    naming_messages(&request.init_message),
                    self.config.generator_models.clone(),
                    metadata.clone(),
                )
                .max_attempts(self.config.max_attempts),
            )
            .await?;

        let response = self
            .ensemble
            .call(
                EnsembleRequest::new(
                    trigger_messages(request, Utc::now()),
                    self.config.trigger_models.clone(),
                    metadata,
                )
                .max_attempts(self.config.trigger_max_attempts)
                .shape(ResponseShape::JsonWith(Arc::new(|value: &Value| {
                    let plan = parse_plan(value)?;
                    parse_triggers(&plan.triggers).map(|_| ())
                }))),
            )
            .await?;
        let plan = parse_plan(response.json.as_ref().unwrap_or(&Value::Null))?;
        let triggers: Vec<Trigger> = parse_triggers(&plan.triggers)?;

        let mut flow = Flow::new(
            &request.account_id,
            &request.user_id,
            request.init_message.clone(),
            triggers,
        );
        flow.readable_name = non_empty(naming.readable_name).unwrap_or_else(|| FALLBACK_NAME.into());
        flow.readable_description =
            non_empty(naming.readable_description).unwrap_or_else(|| FALLBACK_NAME.into());
        flow.metadata.agent_codes = request.agent_codes.clone();
        flow.metadata.init_message = Some(request.init_message.clone());
        flow.metadata.readable_description_of_triggers =
            Some(plan.readable_description_of_triggers.unwrap_or_default());

        self.store.insert_flow(&flow)?;

        let mut patch = Map::new();
        patch.insert("flowId".into(), Value::String(flow.id.to_string()));
        self.ensemble.enrich(&correlation, &patch)?;

        info!(
            flow_id = %flow.id,
            name = %flow.readable_name,
            triggers = flow.triggers.len(),
            "Flow generated"
        );
        Ok(flow)
    }
}

fn parse_plan(value: &Value) -> Result<TriggerPlan> {
    let plan: TriggerPlan =
        serde_json::from_value(value.clone()).map_err(|e| FlowdError::LlmParse(e.to_string()))?;
    if plan.triggers.is_empty() {
        return Err(FlowdError::LlmParse("no triggers in plan".into()));
    }
    Ok(plan)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn naming_messages(init_message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "Create a simple readable_name (max 4-5 words) and readable_description \
             (max 2-3 sentences) based on the user's initial message.",
        ),
        ChatMessage::user(format!(
            "Initial message: {}\n\nOutput format: (JSON)\n\
             {{\n    \"readable_name\": \"<readable_name>\",\n    \"readable_description\": \"<readable_description>\"\n}}\n\
             ONLY output the JSON, nothing else.",
            init_message
        )),
    ]
}

fn trigger_messages(request: &GenerateFlowRequest, now: DateTime<Utc>) -> Vec<ChatMessage> {
    let user_now = now + ChronoDuration::seconds(request.timezone_offset_secs);
    let events = if request.available_events.is_empty() {
        "none".to_string()
    } else {
        request
            .available_events
            .iter()
            .map(|e| format!("- {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    };

    vec![
        ChatMessage::system("You are a helpful assistant to figure out when to run a task."),
        ChatMessage::user(format!(
            r#"Given the following task that the user wants to run:
------------
{task}
------------

Figure out when to run the task, i.e. which triggers apply.

Available triggers are:
1. "once|<delay>|": creates one run after <delay> milliseconds. Use it for one-off or delayed tasks, or when no other trigger fits.
2. "crontab|<crontab_string>|": creates a run on every match of the 5-field crontab string while the flow is active.
3. "event.once|<event_id>|": creates a run the next time the event fires.
4. "event.every|<event_id>|": creates a run every time the event fires.

At least one trigger is mandatory. Worst case, use "once|0|".

Available events:
{events}

Current date and time at the user's timezone: {user_now}
Current date and time at the server's timezone: {server_now}

Timezone:
Server is at UTC.
User's timezone offset is {offset} seconds.

Rules:
- Delays and crontab expressions are evaluated by the server, so convert the user's times to server time.
- Ex: if the user's time is 4PM and they say run at 5PM, the delay is 1 hour.
- Ex: if the user's time is 4PM Monday (server 2PM Monday) and they say every Monday at 5PM, the crontab is "0 15 * * 1".

Output format: (JSON)
{{
    "readableDescriptionOfTriggers": "<describe the triggers for the user>",
    "triggers": ["trigger1", "trigger2"]
}}

ONLY output the JSON, nothing else."#,
            task = request.init_message,
            events = events,
            user_now = user_now.format("%A, %B %-d %Y %H:%M"),
            server_now = now.format("%A, %B %-d %Y %H:%M"),
            offset = request.timezone_offset_secs,
        )),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowd_core::traits::CallRecordStore;
    use flowd_core::types::{FlowStatus, PageRequest};
    use flowd_llm::ProviderRegistry;
    use flowd_store::SqliteStore;
    use flowd_test_utils::{memory_store, ScriptedProvider};

    const NAMING: &str = r#"{"readable_name": "Daily HN digest", "readable_description": "Summarizes Hacker News."}"#;

    fn generator(provider: ScriptedProvider) -> (FlowGenerator, Arc<SqliteStore>, Arc<ScriptedProvider>) {
        let store = memory_store();
        let provider = Arc::new(provider);
        let registry = ProviderRegistry::new().with_models(&["namer", "planner", "backup"], provider.clone());
        let ensemble = Arc::new(Ensemble::new(registry, store.clone()));
        let config = EnsembleConfig {
            generator_models: vec!["namer".into()],
            trigger_models: vec!["planner".into(), "backup".into()],
            max_attempts: 1,
            trigger_max_attempts: 2,
            ..EnsembleConfig::default()
        };
        (FlowGenerator::new(ensemble, store.clone(), config), store, provider)
    }

    fn request() -> GenerateFlowRequest {
        GenerateFlowRequest {
            account_id: "acct-1".into(),
            user_id: "user-1".into(),
            init_message: "Every morning at 9 send me the top HN stories".into(),
            agent_codes: vec!["DEEPRESEARCH_AGENT".into()],
            available_events: vec![],
            timezone_offset_secs: 3600,
        }
    }

    #[tokio::test]
    async fn generates_named_flow_with_triggers() {
        let (generator, store, _) = generator(
            ScriptedProvider::new().text("namer", NAMING).text(
                "planner",
                r#"{"readableDescriptionOfTriggers": "Every day at 9", "triggers": ["crontab|0 8 * * *|"]}"#,
            ),
        );

        let flow = generator.generate(&request()).await.unwrap();
        assert_eq!(flow.readable_name, "Daily HN digest");
        assert_eq!(flow.status, FlowStatus::Active);
        assert_eq!(flow.triggers, vec![Trigger::Crontab { expr: "0 8 * * *".into() }]);
        assert_eq!(flow.metadata.agent_codes, vec!["DEEPRESEARCH_AGENT"]);
        assert_eq!(
            flow.metadata.readable_description_of_triggers.as_deref(),
            Some("Every day at 9")
        );

        let stored = store.get_flow(&flow.id).unwrap().unwrap();
        assert_eq!(stored.task, flow.task);
    }

    #[tokio::test]
    async fn every_attempt_is_enriched_with_flow_id() {
        let (generator, store, _) = generator(
            ScriptedProvider::new()
                .text("namer", NAMING)
                .text("planner", r#"{"triggers": ["sometimes|now|"]}"#)
                .text("backup", r#"{"triggers": ["once|0|"]}"#),
        );

        let flow = generator.generate(&request()).await.unwrap();
        assert_eq!(flow.triggers, vec![Trigger::immediate()]);

        let records = store
            .list_call_records("acct-1", Some(&flow.id), PageRequest::default())
            .unwrap();
        // Naming, the rejected plan, and the accepted plan.
        assert_eq!(records.total_count, 3);
        let correlation = &records.items[0].correlation;
        assert!(records.items.iter().all(|r| &r.correlation == correlation));
        assert!(records.items.iter().all(|r| r.usecase == USECASE));
        assert_eq!(records.items.iter().filter(|r| !r.outcome.is_success()).count(), 1);
    }

    #[tokio::test]
    async fn naming_failure_creates_nothing() {
        let (generator, store, provider) = generator(
            ScriptedProvider::new()
                .fail("namer", "quota")
                .text("planner", r#"{"triggers": ["once|0|"]}"#),
        );

        let err = generator.generate(&request()).await.unwrap_err();
        assert!(matches!(err, FlowdError::EnsembleExhausted { .. }));
        assert_eq!(provider.called_models(), vec!["namer"]);
        assert!(store
            .list_schedulable_flows()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn empty_task_is_rejected() {
        let (generator, _, provider) = generator(ScriptedProvider::new());
        let mut req = request();
        req.init_message = "  ".into();
        assert!(matches!(
            generator.generate(&req).await,
            Err(FlowdError::InvalidArgument(_))
        ));
        assert!(provider.called_models().is_empty());
    }

    #[test]
    fn trigger_prompt_carries_both_clocks() {
        let now = Utc.with_ymd_and_hms(2026, 10, 12, 14, 0, 0).unwrap();
        let mut req = request();
        req.available_events = vec!["gmail.new_mail".into()];
        let messages = trigger_messages(&req, now);
        let prompt = &messages[1].content;
        assert!(prompt.contains("user's timezone: Monday, October 12 2026 15:00"));
        assert!(prompt.contains("server's timezone: Monday, October 12 2026 14:00"));
        assert!(prompt.contains("offset is 3600 seconds"));
        assert!(prompt.contains("- gmail.new_mail"));
    }
}
