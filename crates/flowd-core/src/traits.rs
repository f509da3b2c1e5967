use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::call::{CorrelationKey, LlmCallRecord};
use crate::error::Result;
use crate::step::{Step, StepContext};
use crate::types::*;

/// A single non-streaming completion request against one model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Ask the backend for a JSON object response when it supports it.
    pub json_mode: bool,
}

/// LLM backend able to serve one or more models.
pub trait CompletionProvider: Send + Sync + 'static {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Run one completion and return the assistant text.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}

/// Computes the next step of a run. Knows nothing about persistence.
pub trait StepExecutor: Send + Sync + 'static {
    fn step(&self, ctx: StepContext) -> BoxFuture<'_, Result<Step>>;
}

/// Receives runs created by the scheduler.
pub trait RunLauncher: Send + Sync + 'static {
    /// Start (or wake) the driver of a run. Must not block.
    fn launch(&self, run_id: RunId);
}

/// Persistence gateway for flows, runs, nodes, threads and message logs.
///
/// Every `update_*` is a read-modify-write executed atomically: the closure
/// sees the current row and its changes are committed only if it returns `Ok`.
pub trait FlowStore: Send + Sync + 'static {
    fn insert_flow(&self, flow: &Flow) -> Result<()>;

    fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>>;

    fn update_flow(
        &self,
        id: &FlowId,
        apply: &mut dyn FnMut(&mut Flow) -> Result<()>,
    ) -> Result<Flow>;

    /// Visible flows of an account (not archived, not generated), ordered by
    /// status then newest first.
    fn list_flows(&self, account_id: &str, window: Window, limit: usize) -> Result<Vec<Flow>>;

    /// Flows the scheduler should have armed.
    fn list_schedulable_flows(&self) -> Result<Vec<Flow>>;

    /// Insert `run` only if its flow is still schedulable, re-checked in the
    /// same transaction. With `spend_trigger`, the one-shot trigger at that
    /// index must be unspent and is marked spent. Returns whether the run was
    /// inserted.
    fn create_triggered_run(&self, run: &Run, spend_trigger: Option<usize>) -> Result<bool>;

    fn insert_run(&self, run: &Run) -> Result<()>;

    fn get_run(&self, id: &RunId) -> Result<Option<Run>>;

    fn update_run(&self, id: &RunId, apply: &mut dyn FnMut(&mut Run) -> Result<()>) -> Result<Run>;

    /// Oldest run of the flow whose status is not `completed`.
    fn first_active_run(&self, flow_id: &FlowId) -> Result<Option<Run>>;

    fn list_runs(&self, flow_id: &FlowId, page: PageRequest) -> Result<Page<Run>>;

    /// Terminal (`completed` or `error`) runs inside the window.
    fn list_run_results(&self, flow_id: &FlowId, window: Window, limit: usize) -> Result<Vec<Run>>;

    fn list_runs_with_status(&self, statuses: &[Status]) -> Result<Vec<Run>>;

    fn insert_node(&self, node: &Node) -> Result<()>;

    fn get_node(&self, id: &NodeId) -> Result<Option<Node>>;

    fn update_node(
        &self,
        id: &NodeId,
        apply: &mut dyn FnMut(&mut Node) -> Result<()>,
    ) -> Result<Node>;

    /// Nodes of a run in creation order.
    fn list_nodes(&self, run_id: &RunId, limit: usize) -> Result<Vec<Node>>;

    fn insert_thread(&self, thread: &Thread) -> Result<()>;

    fn list_threads(&self, run_id: &RunId, limit: usize) -> Result<Vec<Thread>>;

    fn append_messages(
        &self,
        flow_id: &FlowId,
        run_id: Option<&RunId>,
        node_id: Option<&NodeId>,
        segment: Segment,
        messages: &[ChatMessage],
    ) -> Result<MessageLogEntry>;

    fn list_messages(
        &self,
        flow_id: &FlowId,
        segment: Segment,
        window: Window,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>>;
}

/// Append-only store for LLM call audit records.
pub trait CallRecordStore: Send + Sync + 'static {
    fn insert_call_record(&self, record: &LlmCallRecord) -> Result<()>;

    /// Merge `patch` into the metadata of every record tagged with
    /// `correlation`. Returns the number of records touched.
    fn enrich_call_records(
        &self,
        correlation: &CorrelationKey,
        patch: &Map<String, Value>,
    ) -> Result<usize>;

    /// Records of an account, optionally narrowed to those whose metadata
    /// carries `flowId`.
    fn list_call_records(
        &self,
        account_id: &str,
        flow_id: Option<&FlowId>,
        page: PageRequest,
    ) -> Result<Page<LlmCallRecord>>;
}
