//! Drives runs through their node sequence.
//!
//! A run is advanced one [`Step`] at a time: the executor decides what to do
//! next and the orchestrator applies it to the store, checking every status
//! change against the run/node state machine. A run that asks for input stops
//! being driven until an answer wakes it again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowd_core::error::{FlowdError, Result};
use flowd_core::event::{EventBus, FlowEvent};
use flowd_core::status::{check_transition, ActiveRunStatus};
use flowd_core::step::{AskScope, RunOutcome, Step, StepContext};
use flowd_core::traits::{FlowStore, RunLauncher, StepExecutor};
use flowd_core::types::{ChatMessage, FlowId, Node, NodeId, Run, RunId, Segment, Status, Thread};

use crate::input_wait::{InputWaitCoordinator, WaitScope};

/// Thread name under which a run's nodes are recorded once it ends.
const MAIN_THREAD: &str = "main";
const NODE_LISTING_LIMIT: usize = 50;

/// Why a drive pass stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    /// Waiting on a question at run or node level.
    Paused,
    /// Another pass is already driving the run.
    Coalesced,
    Cancelled,
}

struct Inner {
    store: Arc<dyn FlowStore>,
    executor: Arc<dyn StepExecutor>,
    event_bus: Arc<EventBus>,
    waits: InputWaitCoordinator,
    max_steps: usize,
    /// Runs being driven; the flag asks the driver for one more pass.
    driving: Mutex<HashMap<RunId, bool>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn FlowStore>,
        executor: Arc<dyn StepExecutor>,
        event_bus: Arc<EventBus>,
        max_steps: usize,
        cancel: CancellationToken,
    ) -> Self {
        let waits = InputWaitCoordinator::new(store.clone(), event_bus.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                event_bus,
                waits,
                max_steps: max_steps.max(1),
                driving: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    pub fn waits(&self) -> &InputWaitCoordinator {
        &self.inner.waits
    }

    /// Drive the run until it ends or pauses.
    ///
    /// Concurrent wakes of the same run coalesce: the second caller returns
    /// [`DriveOutcome::Coalesced`] immediately and the running driver makes
    /// one more pass once its current one stops.
    pub async fn wake(&self, run_id: &RunId) -> Result<DriveOutcome> {
        {
            let mut driving = self.driving()?;
            if let Some(again) = driving.get_mut(run_id) {
                *again = true;
                debug!(run_id = %run_id, "Run already being driven, coalescing wake");
                return Ok(DriveOutcome::Coalesced);
            }
            driving.insert(run_id.clone(), false);
        }

        loop {
            let result = self.drive(run_id).await;

            let mut driving = self.driving()?;
            let again = driving.get(run_id).copied().unwrap_or(false);
            if again && result.is_ok() {
                driving.insert(run_id.clone(), false);
                continue;
            }
            driving.remove(run_id);
            return result;
        }
    }

    /// Re-launch every run that was queued or running when the process stopped.
    pub fn recover(&self) -> Result<usize> {
        let runs = self
            .inner
            .store
            .list_runs_with_status(&[Status::Queued, Status::Running])?;
        let count = runs.len();
        for run in runs {
            self.launch(run.id);
        }
        if count > 0 {
            info!(count, "Recovered unfinished runs");
        }
        Ok(count)
    }

    /// The flow's authoritative run, as the UI shows it.
    pub fn active_run_status(&self, flow_id: &FlowId) -> Result<Option<ActiveRunStatus>> {
        let Some(run) = self.inner.store.first_active_run(flow_id)? else {
            return Ok(None);
        };
        let node = self.working_node(&run)?;
        Ok(Some(ActiveRunStatus::derive(&run, node.as_ref())))
    }

    fn driving(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, bool>>> {
        self.inner
            .driving
            .lock()
            .map_err(|e| FlowdError::InvalidArgument(format!("driver registry poisoned: {}", e)))
    }

    async fn drive(&self, run_id: &RunId) -> Result<DriveOutcome> {
        let store = &self.inner.store;
        let mut steps = 0usize;

        loop {
            if self.inner.cancel.is_cancelled() {
                return Ok(DriveOutcome::Cancelled);
            }

            let mut run = store
                .get_run(run_id)?
                .ok_or_else(|| FlowdError::not_found("run", run_id))?;

            match run.status {
                Status::Completed => return Ok(DriveOutcome::Completed),
                Status::Error => return Ok(DriveOutcome::Failed),
                Status::AskUserForInput => return Ok(DriveOutcome::Paused),
                Status::Queued => {
                    run = self.set_run_status(run_id, Status::Running)?;
                    info!(run_id = %run_id, flow_id = %run.flow_id, "Run started");
                }
                Status::Running => {}
            }

            let node = self.working_node(&run)?;
            if node.as_ref().is_some_and(|n| n.status == Status::AskUserForInput) {
                return Ok(DriveOutcome::Paused);
            }

            if steps >= self.inner.max_steps {
                let message = format!("run exceeded {} steps", self.inner.max_steps);
                self.fail_run(run_id, &message)?;
                return Ok(DriveOutcome::Failed);
            }

            let flow = store
                .get_flow(&run.flow_id)?
                .ok_or_else(|| FlowdError::not_found("flow", &run.flow_id))?;
            let ctx = StepContext {
                flow,
                run: run.clone(),
                node: node.clone(),
                step_index: steps,
            };

            let step = match self.inner.executor.step(ctx).await {
                Ok(step) => step,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Step failed");
                    self.fail_run(run_id, &e.to_string())?;
                    return Ok(DriveOutcome::Failed);
                }
            };
            steps += 1;

            match self.apply(&run, node, step) {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(e @ FlowdError::Database(_)) => return Err(e),
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Step could not be applied");
                    self.fail_run(run_id, &e.to_string())?;
                    return Ok(DriveOutcome::Failed);
                }
            }
        }
    }

    /// Apply one step. Returns an outcome when the step ends the pass.
    fn apply(&self, run: &Run, node: Option<Node>, step: Step) -> Result<Option<DriveOutcome>> {
        let store = &self.inner.store;
        let bus = &self.inner.event_bus;

        match step {
            Step::StartNode { name, input } => {
                if let Some(live) = node.filter(|n| n.status == Status::Running) {
                    self.complete_node(run, &live.id, None)?;
                }
                let node = Node::new(run.id.clone(), name, input);
                store.insert_node(&node)?;
                store.update_run(&run.id, &mut |r| {
                    r.private_data.working_on_node_id = Some(node.id.clone());
                    Ok(())
                })?;
                self.debug_log(run, Some(&node.id), format!("Started node {}", node.name));
                bus.publish(FlowEvent::NodeStarted {
                    run_id: run.id.clone(),
                    node_id: node.id.clone(),
                    name: node.name.clone(),
                });
                debug!(run_id = %run.id, node_id = %node.id, name = %node.name, "Node started");
                Ok(None)
            }
            Step::LiveStatus(text) => {
                match node.filter(|n| n.status == Status::Running) {
                    Some(live) => {
                        store.update_node(&live.id, &mut |n| {
                            n.live_status = Some(text.clone());
                            Ok(())
                        })?;
                        bus.publish(FlowEvent::LiveStatus {
                            run_id: run.id.clone(),
                            node_id: Some(live.id),
                            text,
                        });
                    }
                    None => {
                        store.update_run(&run.id, &mut |r| {
                            r.live_status = Some(text.clone());
                            Ok(())
                        })?;
                        bus.publish(FlowEvent::LiveStatus {
                            run_id: run.id.clone(),
                            node_id: None,
                            text,
                        });
                    }
                }
                Ok(None)
            }
            Step::CompleteNode { output } => {
                let live = node.ok_or_else(|| {
                    FlowdError::InvalidArgument("no live node to complete".into())
                })?;
                self.complete_node(run, &live.id, Some(output))?;
                Ok(None)
            }
            Step::AskUser { scope, prompt } => {
                let scope = match scope {
                    AskScope::Run => WaitScope::Run(run.id.clone()),
                    AskScope::Node => {
                        let live = node.ok_or_else(|| {
                            FlowdError::InvalidArgument("node-level question without a live node".into())
                        })?;
                        WaitScope::Node {
                            run_id: run.id.clone(),
                            node_id: live.id,
                        }
                    }
                };
                self.inner.waits.request_input(&scope, prompt)?;
                Ok(Some(DriveOutcome::Paused))
            }
            Step::Merge(patch) => {
                store.update_run(&run.id, &mut |r| {
                    r.structured_output.extend(patch.clone());
                    Ok(())
                })?;
                Ok(None)
            }
            Step::Finish(outcome) => {
                if let Some(live) = node.filter(|n| n.status == Status::Running) {
                    self.complete_node(run, &live.id, None)?;
                }
                self.finish_run(run, outcome)?;
                Ok(Some(DriveOutcome::Completed))
            }
        }
    }

    fn complete_node(&self, run: &Run, node_id: &NodeId, output: Option<Value>) -> Result<()> {
        self.inner.store.update_node(node_id, &mut |n| {
            check_transition("node", n.id.as_str(), n.status, Status::Completed)?;
            n.status = Status::Completed;
            n.live_status = None;
            if output.is_some() {
                n.output = output.clone();
            }
            Ok(())
        })?;
        self.inner.store.update_run(&run.id, &mut |r| {
            if r.private_data.working_on_node_id.as_ref() == Some(node_id) {
                r.private_data.working_on_node_id = None;
            }
            Ok(())
        })?;
        self.inner.event_bus.publish(FlowEvent::NodeStatusChanged {
            run_id: run.id.clone(),
            node_id: node_id.clone(),
            status: Status::Completed,
        });
        Ok(())
    }

    fn finish_run(&self, run: &Run, outcome: RunOutcome) -> Result<()> {
        let RunOutcome {
            output,
            structured_output,
            reasoning,
        } = outcome;

        self.inner.store.update_run(&run.id, &mut |r| {
            check_transition("run", r.id.as_str(), r.status, Status::Completed)?;
            r.status = Status::Completed;
            r.live_status = None;
            r.output = output.clone();
            r.structured_output.extend(structured_output.clone());
            r.reasoning = reasoning.clone();
            Ok(())
        })?;

        if let Some(text) = &output {
            self.debug_log(run, None, format!("Run completed: {}", text));
        }
        self.record_thread(&run.id);
        self.inner.event_bus.publish(FlowEvent::RunStatusChanged {
            run_id: run.id.clone(),
            status: Status::Completed,
        });
        self.inner.event_bus.publish(FlowEvent::RunCompleted {
            run_id: run.id.clone(),
            flow_id: run.flow_id.clone(),
        });
        info!(run_id = %run.id, flow_id = %run.flow_id, "Run completed");
        Ok(())
    }

    /// Move the run, and its live node, to `error`.
    ///
    /// Partial structured output stays on the run.
    fn fail_run(&self, run_id: &RunId, message: &str) -> Result<()> {
        let store = &self.inner.store;
        let Some(run) = store.get_run(run_id)? else {
            return Err(FlowdError::not_found("run", run_id));
        };
        if run.status.is_terminal() {
            return Ok(());
        }

        if let Some(node) = self.working_node(&run)?.filter(|n| !n.status.is_terminal()) {
            store.update_node(&node.id, &mut |n| {
                n.status = Status::Error;
                n.error = Some(message.to_string());
                Ok(())
            })?;
            self.inner.event_bus.publish(FlowEvent::NodeStatusChanged {
                run_id: run_id.clone(),
                node_id: node.id.clone(),
                status: Status::Error,
            });
        }

        store.update_run(run_id, &mut |r| {
            check_transition("run", r.id.as_str(), r.status, Status::Error)?;
            r.status = Status::Error;
            r.error = Some(message.to_string());
            r.live_status = None;
            Ok(())
        })?;

        self.debug_log(&run, None, format!("Run failed: {}", message));
        self.record_thread(run_id);
        self.inner.event_bus.publish(FlowEvent::RunStatusChanged {
            run_id: run_id.clone(),
            status: Status::Error,
        });
        self.inner.event_bus.publish(FlowEvent::RunError {
            run_id: run_id.clone(),
            flow_id: run.flow_id.clone(),
            error: message.to_string(),
        });
        error!(run_id = %run_id, flow_id = %run.flow_id, error = %message, "Run failed");
        Ok(())
    }

    fn set_run_status(&self, run_id: &RunId, status: Status) -> Result<Run> {
        let run = self.inner.store.update_run(run_id, &mut |r| {
            check_transition("run", r.id.as_str(), r.status, status)?;
            r.status = status;
            Ok(())
        })?;
        self.inner.event_bus.publish(FlowEvent::RunStatusChanged {
            run_id: run_id.clone(),
            status,
        });
        Ok(run)
    }

    fn working_node(&self, run: &Run) -> Result<Option<Node>> {
        match &run.private_data.working_on_node_id {
            Some(node_id) => self.inner.store.get_node(node_id),
            None => Ok(None),
        }
    }

    /// Record the run's nodes, in creation order, as its main thread.
    fn record_thread(&self, run_id: &RunId) {
        let nodes = match self.inner.store.list_nodes(run_id, NODE_LISTING_LIMIT) {
            Ok(nodes) if !nodes.is_empty() => nodes,
            Ok(_) => return,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to list nodes for thread");
                return;
            }
        };
        let mut thread = Thread::new(run_id.clone(), MAIN_THREAD);
        thread.node_ids = nodes.into_iter().map(|n| n.id).collect();
        if let Err(e) = self.inner.store.insert_thread(&thread) {
            warn!(run_id = %run_id, error = %e, "Failed to record thread");
        }
    }

    fn debug_log(&self, run: &Run, node_id: Option<&NodeId>, text: String) {
        let message = ChatMessage::assistant(text);
        if let Err(e) = self.inner.store.append_messages(
            &run.flow_id,
            Some(&run.id),
            node_id,
            Segment::Debug,
            std::slice::from_ref(&message),
        ) {
            warn!(run_id = %run.id, error = %e, "Failed to append debug log");
        }
    }
}

impl RunLauncher for Orchestrator {
    fn launch(&self, run_id: RunId) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.wake(&run_id).await {
                error!(run_id = %run_id, error = %e, "Run driver failed");
            }
        });
    }
}
