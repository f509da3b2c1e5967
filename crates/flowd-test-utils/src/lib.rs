//! Shared test utilities, mocks, and fixtures for flowd crates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use flowd_core::error::{FlowdError, Result};
use flowd_core::step::{Step, StepContext};
use flowd_core::traits::{CompletionProvider, CompletionRequest, FlowStore, RunLauncher, StepExecutor};
use flowd_core::trigger::Trigger;
use flowd_core::types::{Flow, RunId, Status};
use flowd_store::SqliteStore;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// A scripted reply for one model.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never answers; exercises attempt timeouts.
    Hang,
}

/// Completion provider that answers from per-model scripts.
///
/// Each model has a queue of replies. The last reply of a queue repeats forever.
/// Models without a script fail.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, model: &str, reply: Reply) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(model.to_string()).or_default().push_back(reply);
        }
        self
    }

    pub fn text(self, model: &str, text: &str) -> Self {
        self.reply(model, Reply::Text(text.to_string()))
    }

    pub fn fail(self, model: &str, message: &str) -> Self {
        self.reply(model, Reply::Fail(message.to_string()))
    }

    /// Models called so far, in order.
    pub fn called_models(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|r| r.model.clone()).collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_reply(&self, model: &str) -> Reply {
        let Ok(mut scripts) = self.scripts.lock() else {
            return Reply::Fail("script lock poisoned".into());
        };
        match scripts.get_mut(model) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Hang),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Fail(format!("no script for {}", model))),
            None => Reply::Fail(format!("no script for {}", model)),
        }
    }
}

impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        let reply = self.next_reply(&request.model);
        let model = request.model.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request);
        }
        Box::pin(async move {
            match reply {
                Reply::Text(text) => Ok(text),
                Reply::Fail(message) => Err(FlowdError::ProviderFailure { model, message }),
                Reply::Hang => {
                    futures::future::pending::<()>().await;
                    Err(FlowdError::ProviderFailure {
                        model,
                        message: "unreachable".into(),
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Step executors
// ---------------------------------------------------------------------------

/// Step executor that replays a fixed script.
///
/// Entries are returned in order; `Err` entries fail the step. Once the script
/// runs out the executor finishes the run with output `"done"`.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<std::result::Result<Step, String>>>,
    seen: Mutex<Vec<StepContext>>,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().map(Ok).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Append a failing step.
    pub fn then_fail(self, message: &str) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(message.to_string()));
        }
        self
    }

    /// Contexts the executor was called with.
    pub fn seen(&self) -> Vec<StepContext> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn step(&self, ctx: StepContext) -> BoxFuture<'_, Result<Step>> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(ctx);
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        Box::pin(async move {
            match next {
                Some(Ok(step)) => Ok(step),
                Some(Err(message)) => Err(FlowdError::InvalidArgument(message)),
                None => Ok(Step::finish("done")),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

/// Run launcher that only records what it was asked to launch.
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<RunId>>,
    notify: Notify,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<RunId> {
        self.launched.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.launched.lock().map(|l| l.len()).unwrap_or_default()
    }

    /// Wait until at least `n` runs were launched, or `timeout` passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let count = self.count();
            if count >= n {
                return count;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count();
            }
        }
    }
}

impl RunLauncher for RecordingLauncher {
    fn launch(&self, run_id: RunId) {
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(run_id);
        }
        self.notify.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().expect("in-memory store"))
}

/// A flow with parsed triggers, not yet stored.
pub fn flow_with_triggers(triggers: &[&str]) -> Flow {
    let triggers = triggers
        .iter()
        .map(|t| t.parse::<Trigger>().expect("valid trigger"))
        .collect();
    Flow::new("acct-test", "user-test", "send me a daily summary", triggers)
}

/// Store a new active flow with the given triggers.
pub fn insert_flow(store: &dyn FlowStore, triggers: &[&str]) -> Flow {
    let flow = flow_with_triggers(triggers);
    store.insert_flow(&flow).expect("insert flow");
    flow
}

/// Poll the store until the run reaches `status`, or `timeout` passes.
pub async fn wait_for_run_status(
    store: &dyn FlowStore,
    run_id: &RunId,
    status: Status,
    timeout: Duration,
) -> Option<Status> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = store.get_run(run_id).ok().flatten().map(|r| r.status);
        if current == Some(status) || tokio::time::Instant::now() >= deadline {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
