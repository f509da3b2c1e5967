use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use flowd_core::call::LlmCallRecord;
use flowd_core::error::{FlowdError, Result};
use flowd_core::event::{EventBus, FlowEvent};
use flowd_core::status::ActiveRunStatus;
use flowd_core::traits::{CallRecordStore, FlowStore, RunLauncher};
use flowd_core::types::{
    clamp_limit, ChatMessage, Flow, FlowId, FlowStatus, InputWait, MessageLogEntry, Node, NodeId,
    Page, PageRequest, Run, RunId, Segment, Thread, Window, MAX_PAGE_SIZE,
};

use crate::generator::{FlowGenerator, GenerateFlowRequest};
use crate::input_wait::WaitScope;
use crate::orchestrator::Orchestrator;
use crate::scheduler::TriggerScheduler;

/// A run with everything needed to draw it.
#[derive(Debug, Clone, Serialize)]
pub struct FlowChart {
    pub run: Run,
    pub nodes: Vec<Node>,
    pub threads: Vec<Thread>,
}

/// Account-scoped entry point over flows, runs and their history.
///
/// Every operation checks that the flow or run belongs to the calling
/// account and reports [`FlowdError::NotFound`] otherwise.
pub struct FlowService {
    store: Arc<dyn FlowStore>,
    calls: Arc<dyn CallRecordStore>,
    event_bus: Arc<EventBus>,
    scheduler: TriggerScheduler,
    orchestrator: Orchestrator,
    generator: FlowGenerator,
    launcher: Arc<dyn RunLauncher>,
}

impl FlowService {
    pub fn new(
        store: Arc<dyn FlowStore>,
        calls: Arc<dyn CallRecordStore>,
        event_bus: Arc<EventBus>,
        scheduler: TriggerScheduler,
        orchestrator: Orchestrator,
        generator: FlowGenerator,
    ) -> Self {
        let launcher: Arc<dyn RunLauncher> = Arc::new(orchestrator.clone());
        Self {
            store,
            calls,
            event_bus,
            scheduler,
            orchestrator,
            generator,
            launcher,
        }
    }

    /// Resume answered runs through `launcher` instead of the orchestrator.
    pub fn with_launcher(mut self, launcher: Arc<dyn RunLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn scheduler(&self) -> &TriggerScheduler {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Arm every schedulable flow and re-drive unfinished runs.
    pub fn start(&self) -> Result<()> {
        let report = self.scheduler.reconcile()?;
        let recovered = self.orchestrator.recover()?;
        info!(armed = report.armed, recovered, "Flow service started");
        Ok(())
    }

    pub async fn create_flow(&self, request: &GenerateFlowRequest) -> Result<Flow> {
        let flow = self.generator.generate(request).await?;
        self.scheduler.arm_flow(&flow);
        Ok(flow)
    }

    /// Switch a flow between `active` and `inactive`.
    ///
    /// Setting the status a flow already has changes nothing. Deactivation
    /// stops future runs only; runs already in flight continue.
    pub fn change_flow_status(&self, account_id: &str, flow_id: &FlowId, status: FlowStatus) -> Result<Flow> {
        if status == FlowStatus::Error {
            return Err(FlowdError::InvalidArgument(
                "flow status can only be set to active or inactive".into(),
            ));
        }

        let flow = self.owned_flow(account_id, flow_id)?;
        if flow.status == status {
            return Ok(flow);
        }

        // Re-checked inside the transaction: a concurrent identical request
        // may have landed since the read above.
        let mut changed = false;
        let flow = self.store.update_flow(flow_id, &mut |f| {
            changed = f.status != status;
            if changed {
                f.previous_status = Some(f.status);
                f.status = status;
            }
            Ok(())
        })?;
        if !changed {
            return Ok(flow);
        }

        match status {
            FlowStatus::Active => {
                self.scheduler.arm_flow(&flow);
            }
            _ => {
                self.scheduler.disarm_flow(flow_id);
            }
        }
        self.event_bus.publish(FlowEvent::FlowStatusChanged {
            flow_id: flow_id.clone(),
            status,
        });
        info!(flow_id = %flow_id, status = %status, "Flow status changed");
        Ok(flow)
    }

    /// Hide an inactive or errored flow. The row is kept.
    pub fn archive_flow(&self, account_id: &str, flow_id: &FlowId) -> Result<Flow> {
        self.owned_flow(account_id, flow_id)?;
        let flow = self.store.update_flow(flow_id, &mut |f| {
            if f.status == FlowStatus::Active {
                return Err(FlowdError::InvalidArgument(
                    "only inactive or errored flows can be archived".into(),
                ));
            }
            f.metadata.archived = true;
            Ok(())
        })?;
        self.scheduler.disarm_flow(flow_id);
        info!(flow_id = %flow_id, "Flow archived");
        Ok(flow)
    }

    pub fn flow_details(&self, account_id: &str, flow_id: &FlowId) -> Result<Flow> {
        self.owned_flow(account_id, flow_id)
    }

    pub fn list_flows(&self, account_id: &str, window: Window, limit: usize) -> Result<Vec<Flow>> {
        self.store.list_flows(account_id, window, clamp_limit(limit))
    }

    pub fn active_run_status(&self, account_id: &str, flow_id: &FlowId) -> Result<Option<ActiveRunStatus>> {
        self.owned_flow(account_id, flow_id)?;
        self.orchestrator.active_run_status(flow_id)
    }

    pub fn list_runs(&self, account_id: &str, flow_id: &FlowId, page: PageRequest) -> Result<Page<Run>> {
        self.owned_flow(account_id, flow_id)?;
        self.store.list_runs(flow_id, page)
    }

    /// Finished runs (completed or errored) on one side of a timestamp.
    pub fn run_results(
        &self,
        account_id: &str,
        flow_id: &FlowId,
        window: Window,
        limit: usize,
    ) -> Result<Vec<Run>> {
        self.owned_flow(account_id, flow_id)?;
        self.store.list_run_results(flow_id, window, clamp_limit(limit))
    }

    pub fn flow_chart(&self, account_id: &str, flow_id: &FlowId, run_id: &RunId) -> Result<FlowChart> {
        self.owned_flow(account_id, flow_id)?;
        let run = self
            .store
            .get_run(run_id)?
            .filter(|r| &r.flow_id == flow_id)
            .ok_or_else(|| FlowdError::not_found("run", run_id))?;
        let nodes = self.store.list_nodes(run_id, MAX_PAGE_SIZE)?;
        let threads = self.store.list_threads(run_id, MAX_PAGE_SIZE)?;
        Ok(FlowChart { run, nodes, threads })
    }

    pub fn message_log(
        &self,
        account_id: &str,
        flow_id: &FlowId,
        segment: Segment,
        window: Window,
        limit: usize,
    ) -> Result<Vec<MessageLogEntry>> {
        self.owned_flow(account_id, flow_id)?;
        self.store
            .list_messages(flow_id, segment, window, clamp_limit(limit))
    }

    pub fn list_llm_calls(
        &self,
        account_id: &str,
        flow_id: Option<&FlowId>,
        page: PageRequest,
    ) -> Result<Page<LlmCallRecord>> {
        if let Some(flow_id) = flow_id {
            self.owned_flow(account_id, flow_id)?;
        }
        self.calls.list_call_records(account_id, flow_id, page)
    }

    /// Answer a run-level question and resume the run.
    pub fn submit_run_input(
        &self,
        account_id: &str,
        run_id: &RunId,
        wait_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<InputWait> {
        self.owned_run(account_id, run_id)?;
        let wait = self
            .orchestrator
            .waits()
            .submit_input(&WaitScope::Run(run_id.clone()), wait_id, messages)?;
        self.launcher.launch(run_id.clone());
        Ok(wait)
    }

    /// Answer a node-level question and resume the run.
    pub fn submit_node_input(
        &self,
        account_id: &str,
        run_id: &RunId,
        node_id: &NodeId,
        wait_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<InputWait> {
        self.owned_run(account_id, run_id)?;
        let scope = WaitScope::Node {
            run_id: run_id.clone(),
            node_id: node_id.clone(),
        };
        let wait = self.orchestrator.waits().submit_input(&scope, wait_id, messages)?;
        self.launcher.launch(run_id.clone());
        Ok(wait)
    }

    /// Fire `event.once`/`event.every` triggers subscribed to `event_id`.
    pub fn deliver_event(&self, event_id: &str, payload: Option<Value>) -> usize {
        self.scheduler.deliver_event(event_id, payload)
    }

    fn owned_flow(&self, account_id: &str, flow_id: &FlowId) -> Result<Flow> {
        self.store
            .get_flow(flow_id)?
            .filter(|f| f.account_id == account_id)
            .ok_or_else(|| FlowdError::not_found("flow", flow_id))
    }

    fn owned_run(&self, account_id: &str, run_id: &RunId) -> Result<Run> {
        self.store
            .get_run(run_id)?
            .filter(|r| r.account_id == account_id)
            .ok_or_else(|| FlowdError::not_found("run", run_id))
    }
}

/// Default window for "latest" listings.
pub fn latest() -> Window {
    Window::Before(Utc::now() + chrono::Duration::seconds(1))
}
