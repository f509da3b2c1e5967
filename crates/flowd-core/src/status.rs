//! Run/Node state machine rules and read-time status derivation.
//!
//! ```text
//! queued ──► running ──► completed
//!   │          ▲  │
//!   │          │  ├────► error
//!   │          │  ▼
//!   │     ask_user_for_input ──► error
//!   └──────────────────────────► error
//! ```
//!
//! A run's externally observed status is never stored separately: it is
//! derived from the run row and its live node every time it is read.

use serde::Serialize;

use crate::error::{FlowdError, Result};
use crate::types::{InputWait, Node, Run, Status};

/// Validate a status transition for an entity.
///
/// Re-applying the current status is accepted for non-terminal states so that
/// idempotent writers do not fail.
pub fn check_transition(entity: &'static str, id: &str, from: Status, to: Status) -> Result<()> {
    use Status::*;

    if from.is_terminal() {
        return Err(FlowdError::TerminalStateViolation {
            entity,
            id: id.to_string(),
            from,
            to,
        });
    }

    let allowed = matches!(
        (from, to),
        (Queued, Queued)
            | (Queued, Running)
            | (Queued, Error)
            | (Running, Running)
            | (Running, AskUserForInput)
            | (Running, Completed)
            | (Running, Error)
            | (AskUserForInput, AskUserForInput)
            | (AskUserForInput, Running)
            | (AskUserForInput, Error)
    );

    if allowed {
        Ok(())
    } else {
        Err(FlowdError::InvalidTransition {
            entity,
            id: id.to_string(),
            from,
            to,
        })
    }
}

/// The status callers should see for a run.
///
/// A run-level question outranks everything; otherwise a running run reports
/// its live node's status.
pub fn effective_status(run: &Run, node: Option<&Node>) -> Status {
    if run.status == Status::AskUserForInput {
        return Status::AskUserForInput;
    }
    match node {
        Some(node) if run.status == Status::Running => node.status,
        _ => run.status,
    }
}

/// Snapshot of a flow's authoritative run, as surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRunStatus {
    pub run_status: Status,
    pub input_wait: Option<InputWait>,
    pub live_status: Option<String>,
}

impl ActiveRunStatus {
    /// Derive the snapshot from a run and the node it is working on.
    ///
    /// `node` must be the run's `working_on_node_id` node if it has one.
    pub fn derive(run: &Run, node: Option<&Node>) -> Self {
        let mut input_wait = run.input_wait.clone().filter(InputWait::is_pending);
        let mut live_status = run.live_status.clone();

        let node = node.filter(|_| run.status == Status::Running);
        if let Some(node) = node {
            if node.live_status.is_some() {
                live_status = node.live_status.clone();
            }
            if node.status == Status::AskUserForInput {
                if let Some(wait) = node.input_wait.as_ref().filter(|w| w.is_pending()) {
                    let mut wait = wait.clone();
                    wait.run_id = run.id.clone();
                    wait.node_id = Some(node.id.clone());
                    input_wait = Some(wait);
                }
            }
        }

        Self {
            run_status: effective_status(run, node),
            input_wait,
            live_status,
        }
    }
}
