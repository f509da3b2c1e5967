use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use flowd_core::error::{FlowdError, Result};
use flowd_core::event::{EventBus, FlowEvent};
use flowd_core::status::check_transition;
use flowd_core::traits::FlowStore;
use flowd_core::types::{ChatMessage, FlowId, InputWait, NodeId, RunId, Segment, Status, WaitStatus};

/// Whose conversation a question belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitScope {
    Run(RunId),
    Node { run_id: RunId, node_id: NodeId },
}

impl WaitScope {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Run(run_id) | Self::Node { run_id, .. } => run_id,
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Run(_) => None,
            Self::Node { node_id, .. } => Some(node_id),
        }
    }
}

impl fmt::Display for WaitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(run_id) => write!(f, "run {}", run_id),
            Self::Node { run_id, node_id } => write!(f, "node {} of run {}", node_id, run_id),
        }
    }
}

/// Pauses runs and nodes on a question and resumes them on a matching answer.
///
/// Both operations are single read-modify-write transactions on the owning
/// row, so an answer either lands completely or not at all. The coordinator
/// does not wake the run; callers hand the run back to the orchestrator.
pub struct InputWaitCoordinator {
    store: Arc<dyn FlowStore>,
    event_bus: Arc<EventBus>,
}

impl InputWaitCoordinator {
    pub fn new(store: Arc<dyn FlowStore>, event_bus: Arc<EventBus>) -> Self {
        Self { store, event_bus }
    }

    /// Install a pending wait on the scope and move it to `ask_user_for_input`.
    ///
    /// A `question` string in the prompt is also appended to the scope's
    /// conversation and to the user message log.
    pub fn request_input(&self, scope: &WaitScope, prompt: Map<String, Value>) -> Result<InputWait> {
        let wait = InputWait {
            id: Uuid::new_v4().to_string(),
            run_id: scope.run_id().clone(),
            node_id: scope.node_id().cloned(),
            status: WaitStatus::Pending,
            created_at: Utc::now(),
            prompt,
        };
        let question = wait
            .prompt
            .get("question")
            .and_then(Value::as_str)
            .map(ChatMessage::assistant);

        let run = match scope {
            WaitScope::Run(run_id) => self.store.update_run(run_id, &mut |run| {
                check_transition("run", run.id.as_str(), run.status, Status::AskUserForInput)?;
                run.status = Status::AskUserForInput;
                run.input_wait = Some(wait.clone());
                run.conversation.extend(question.clone());
                Ok(())
            })?,
            WaitScope::Node { run_id, node_id } => {
                self.store.update_node(node_id, &mut |node| {
                    if &node.run_id != run_id {
                        return Err(FlowdError::InvalidArgument(format!(
                            "node {} does not belong to run {}",
                            node.id, run_id
                        )));
                    }
                    check_transition("node", node.id.as_str(), node.status, Status::AskUserForInput)?;
                    node.status = Status::AskUserForInput;
                    node.input_wait = Some(wait.clone());
                    node.conversation.extend(question.clone());
                    Ok(())
                })?;
                self.store
                    .get_run(run_id)?
                    .ok_or_else(|| FlowdError::not_found("run", run_id))?
            }
        };

        if let Some(question) = &question {
            self.mirror(&run.flow_id, scope, std::slice::from_ref(question));
        }

        self.publish_status(scope, Status::AskUserForInput);
        self.event_bus.publish(FlowEvent::InputRequested {
            run_id: wait.run_id.clone(),
            node_id: wait.node_id.clone(),
            input_wait_id: wait.id.clone(),
        });
        info!(scope = %scope, wait_id = %wait.id, "Waiting for user input");
        Ok(wait)
    }

    /// Answer the pending wait `wait_id` on the scope.
    ///
    /// The wait must be pending, match `wait_id`, and the scope must still be
    /// asking. Otherwise [`FlowdError::StaleInputWait`] is returned and nothing
    /// changes. On success the messages are appended to the conversation, the
    /// wait is completed and the scope goes back to `running`.
    pub fn submit_input(
        &self,
        scope: &WaitScope,
        wait_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<InputWait> {
        let mut answered = None;

        let run = match scope {
            WaitScope::Run(run_id) => self.store.update_run(run_id, &mut |run| {
                let wait = claim_wait(scope, wait_id, run.status, run.input_wait.as_mut())?;
                check_transition("run", run.id.as_str(), run.status, Status::Running)?;
                answered = Some(wait);
                run.status = Status::Running;
                run.conversation.extend(messages.iter().cloned());
                Ok(())
            })?,
            WaitScope::Node { run_id, node_id } => {
                self.store.update_node(node_id, &mut |node| {
                    if &node.run_id != run_id {
                        return Err(stale(scope, wait_id));
                    }
                    let wait = claim_wait(scope, wait_id, node.status, node.input_wait.as_mut())?;
                    check_transition("node", node.id.as_str(), node.status, Status::Running)?;
                    answered = Some(wait);
                    node.status = Status::Running;
                    node.conversation.extend(messages.iter().cloned());
                    Ok(())
                })?;
                self.store
                    .get_run(run_id)?
                    .ok_or_else(|| FlowdError::not_found("run", run_id))?
            }
        };

        let wait = answered.ok_or_else(|| stale(scope, wait_id))?;
        self.mirror(&run.flow_id, scope, &messages);

        self.publish_status(scope, Status::Running);
        self.event_bus.publish(FlowEvent::InputSubmitted {
            run_id: wait.run_id.clone(),
            node_id: wait.node_id.clone(),
            input_wait_id: wait.id.clone(),
        });
        info!(scope = %scope, wait_id = %wait.id, messages = messages.len(), "User input received");
        Ok(wait)
    }

    /// The pending wait on the scope, if it is currently asking.
    pub fn pending_wait(&self, scope: &WaitScope) -> Result<Option<InputWait>> {
        let (status, wait) = match scope {
            WaitScope::Run(run_id) => {
                let run = self
                    .store
                    .get_run(run_id)?
                    .ok_or_else(|| FlowdError::not_found("run", run_id))?;
                (run.status, run.input_wait)
            }
            WaitScope::Node { node_id, .. } => {
                let node = self
                    .store
                    .get_node(node_id)?
                    .ok_or_else(|| FlowdError::not_found("node", node_id))?;
                (node.status, node.input_wait)
            }
        };
        Ok(wait.filter(|w| status == Status::AskUserForInput && w.is_pending()))
    }

    fn mirror(&self, flow_id: &FlowId, scope: &WaitScope, messages: &[ChatMessage]) {
        if messages.is_empty() {
            return;
        }
        if let Err(e) = self.store.append_messages(
            flow_id,
            Some(scope.run_id()),
            scope.node_id(),
            Segment::User,
            messages,
        ) {
            warn!(scope = %scope, error = %e, "Failed to append to message log");
        }
    }

    fn publish_status(&self, scope: &WaitScope, status: Status) {
        let event = match scope {
            WaitScope::Run(run_id) => FlowEvent::RunStatusChanged {
                run_id: run_id.clone(),
                status,
            },
            WaitScope::Node { run_id, node_id } => FlowEvent::NodeStatusChanged {
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                status,
            },
        };
        self.event_bus.publish(event);
    }
}

/// Mark the wait completed if it is the one being answered.
fn claim_wait(
    scope: &WaitScope,
    wait_id: &str,
    status: Status,
    wait: Option<&mut InputWait>,
) -> Result<InputWait> {
    match wait {
        Some(wait) if status == Status::AskUserForInput && wait.is_pending() && wait.id == wait_id => {
            wait.status = WaitStatus::Completed;
            Ok(wait.clone())
        }
        _ => Err(stale(scope, wait_id)),
    }
}

fn stale(scope: &WaitScope, wait_id: &str) -> FlowdError {
    FlowdError::StaleInputWait {
        scope: scope.to_string(),
        got: wait_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowd_core::types::{Node, Run, Window};
    use flowd_test_utils::{insert_flow, memory_store};
    use flowd_store::SqliteStore;

    struct Fixture {
        store: Arc<SqliteStore>,
        coordinator: InputWaitCoordinator,
        run: Run,
        node: Node,
    }

    fn fixture() -> Fixture {
        let store = memory_store();
        let flow = insert_flow(store.as_ref(), &["once|0|"]);
        let mut run = Run::new(&flow, None);
        run.status = Status::Running;
        store.insert_run(&run).unwrap();
        let node = Node::new(run.id.clone(), "research", Value::Null);
        store.insert_node(&node).unwrap();
        let coordinator = InputWaitCoordinator::new(store.clone(), Arc::new(EventBus::default()));
        Fixture {
            store,
            coordinator,
            run,
            node,
        }
    }

    fn question(q: &str) -> Map<String, Value> {
        let mut prompt = Map::new();
        prompt.insert("question".into(), Value::String(q.into()));
        prompt
    }

    #[test]
    fn run_level_round_trip() {
        let f = fixture();
        let scope = WaitScope::Run(f.run.id.clone());
        let wait = f.coordinator.request_input(&scope, question("Which repo?")).unwrap();

        let asking = f.store.get_run(&f.run.id).unwrap().unwrap();
        assert_eq!(asking.status, Status::AskUserForInput);
        assert_eq!(asking.input_wait.as_ref().unwrap().id, wait.id);
        assert_eq!(f.coordinator.pending_wait(&scope).unwrap().unwrap().id, wait.id);

        let done = f
            .coordinator
            .submit_input(&scope, &wait.id, vec![ChatMessage::user("flowd")])
            .unwrap();
        assert_eq!(done.status, WaitStatus::Completed);

        let run = f.store.get_run(&f.run.id).unwrap().unwrap();
        assert_eq!(run.status, Status::Running);
        assert_eq!(run.input_wait.unwrap().status, WaitStatus::Completed);
        let contents: Vec<_> = run.conversation.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Which repo?", "flowd"]);
        assert!(f.coordinator.pending_wait(&scope).unwrap().is_none());

        let log = f
            .store
            .list_messages(&f.run.flow_id, Segment::User, Window::After(f.run.created_at), 50)
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].messages[0].content, "flowd");
    }

    #[test]
    fn stale_wait_id_changes_nothing() {
        let f = fixture();
        let scope = WaitScope::Run(f.run.id.clone());
        f.coordinator.request_input(&scope, question("Which repo?")).unwrap();
        let before = serde_json::to_value(f.store.get_run(&f.run.id).unwrap().unwrap()).unwrap();

        let err = f
            .coordinator
            .submit_input(&scope, "not-the-wait", vec![ChatMessage::user("x")])
            .unwrap_err();
        assert!(matches!(err, FlowdError::StaleInputWait { .. }));

        let after = serde_json::to_value(f.store.get_run(&f.run.id).unwrap().unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn stale_node_wait_id_changes_nothing() {
        let f = fixture();
        let scope = WaitScope::Node {
            run_id: f.run.id.clone(),
            node_id: f.node.id.clone(),
        };
        let wait = f.coordinator.request_input(&scope, question("Depth?")).unwrap();
        let node_before = serde_json::to_value(f.store.get_node(&f.node.id).unwrap().unwrap()).unwrap();
        let run_before = serde_json::to_value(f.store.get_run(&f.run.id).unwrap().unwrap()).unwrap();
        let log_window = Window::After(f.run.created_at);
        let log_before = f
            .store
            .list_messages(&f.run.flow_id, Segment::User, log_window, 50)
            .unwrap()
            .len();

        let err = f
            .coordinator
            .submit_input(&scope, "not-the-wait", vec![ChatMessage::user("x")])
            .unwrap_err();
        assert!(matches!(err, FlowdError::StaleInputWait { .. }));

        let node = f.store.get_node(&f.node.id).unwrap().unwrap();
        assert_eq!(node.status, Status::AskUserForInput);
        assert_eq!(node.input_wait.as_ref().map(|w| w.id.as_str()), Some(wait.id.as_str()));
        assert_eq!(serde_json::to_value(&node).unwrap(), node_before);
        assert_eq!(
            serde_json::to_value(f.store.get_run(&f.run.id).unwrap().unwrap()).unwrap(),
            run_before
        );
        let log_after = f
            .store
            .list_messages(&f.run.flow_id, Segment::User, log_window, 50)
            .unwrap()
            .len();
        assert_eq!(log_after, log_before);
        assert_eq!(f.coordinator.pending_wait(&scope).unwrap().unwrap().id, wait.id);
    }

    #[test]
    fn answering_twice_is_stale() {
        let f = fixture();
        let scope = WaitScope::Run(f.run.id.clone());
        let wait = f.coordinator.request_input(&scope, Map::new()).unwrap();
        f.coordinator.submit_input(&scope, &wait.id, vec![]).unwrap();

        let err = f.coordinator.submit_input(&scope, &wait.id, vec![]).unwrap_err();
        assert!(matches!(err, FlowdError::StaleInputWait { .. }));
    }

    #[test]
    fn submit_without_pending_wait_is_stale() {
        let f = fixture();
        let err = f
            .coordinator
            .submit_input(&WaitScope::Run(f.run.id.clone()), "w", vec![])
            .unwrap_err();
        assert!(matches!(err, FlowdError::StaleInputWait { .. }));
        assert_eq!(f.store.get_run(&f.run.id).unwrap().unwrap().status, Status::Running);
    }

    #[test]
    fn node_and_run_waits_are_independent() {
        let f = fixture();
        let node_scope = WaitScope::Node {
            run_id: f.run.id.clone(),
            node_id: f.node.id.clone(),
        };
        let run_scope = WaitScope::Run(f.run.id.clone());
        let node_wait = f.coordinator.request_input(&node_scope, question("Depth?")).unwrap();

        // The run row is untouched by a node-level question.
        let run = f.store.get_run(&f.run.id).unwrap().unwrap();
        assert_eq!(run.status, Status::Running);
        assert!(run.input_wait.is_none());

        // A node wait id is not accepted on the run scope.
        let err = f.coordinator.submit_input(&run_scope, &node_wait.id, vec![]).unwrap_err();
        assert!(matches!(err, FlowdError::StaleInputWait { .. }));

        f.coordinator
            .submit_input(&node_scope, &node_wait.id, vec![ChatMessage::user("deep")])
            .unwrap();
        let node = f.store.get_node(&f.node.id).unwrap().unwrap();
        assert_eq!(node.status, Status::Running);
        assert_eq!(node.conversation.last().unwrap().content, "deep");
    }

    #[test]
    fn node_scope_must_match_run() {
        let f = fixture();
        let scope = WaitScope::Node {
            run_id: RunId::from_string("someone-else"),
            node_id: f.node.id.clone(),
        };
        assert!(matches!(
            f.coordinator.request_input(&scope, Map::new()),
            Err(FlowdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn terminal_run_cannot_ask() {
        let f = fixture();
        f.store
            .update_run(&f.run.id, &mut |run| {
                run.status = Status::Completed;
                Ok(())
            })
            .unwrap();
        let err = f
            .coordinator
            .request_input(&WaitScope::Run(f.run.id.clone()), Map::new())
            .unwrap_err();
        assert!(matches!(err, FlowdError::TerminalStateViolation { .. }));
    }
}
