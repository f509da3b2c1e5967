use crate::call::CorrelationKey;
use crate::types::{FlowId, FlowStatus, NodeId, RunId, Status};

/// Lifecycle events published by the scheduler, orchestrator and ensemble.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    FlowStatusChanged {
        flow_id: FlowId,
        status: FlowStatus,
    },
    TriggerFired {
        flow_id: FlowId,
        trigger_index: usize,
        trigger: String,
    },
    /// A firing was dropped because the flow stopped being schedulable.
    SchedulingRaceDropped {
        flow_id: FlowId,
        trigger_index: usize,
    },
    RunCreated {
        run_id: RunId,
        flow_id: FlowId,
    },
    RunStatusChanged {
        run_id: RunId,
        status: Status,
    },
    NodeStarted {
        run_id: RunId,
        node_id: NodeId,
        name: String,
    },
    NodeStatusChanged {
        run_id: RunId,
        node_id: NodeId,
        status: Status,
    },
    LiveStatus {
        run_id: RunId,
        node_id: Option<NodeId>,
        text: String,
    },
    InputRequested {
        run_id: RunId,
        node_id: Option<NodeId>,
        input_wait_id: String,
    },
    InputSubmitted {
        run_id: RunId,
        node_id: Option<NodeId>,
        input_wait_id: String,
    },
    LlmAttempt {
        correlation: CorrelationKey,
        model: String,
        attempt: u32,
        error: Option<String>,
        duration_ms: u64,
    },
    RunCompleted {
        run_id: RunId,
        flow_id: FlowId,
    },
    RunError {
        run_id: RunId,
        flow_id: FlowId,
        error: String,
    },
}

impl FlowEvent {
    /// The run this event belongs to, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStatusChanged { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeStatusChanged { run_id, .. }
            | Self::LiveStatus { run_id, .. }
            | Self::InputRequested { run_id, .. }
            | Self::InputSubmitted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunError { run_id, .. } => Some(run_id),
            _ => None,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
