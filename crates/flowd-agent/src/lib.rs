pub mod executor;
pub mod generator;
pub mod input_wait;
pub mod orchestrator;
pub mod run_log;
pub mod scheduler;
pub mod service;

pub use executor::LlmStepExecutor;
pub use generator::{FlowGenerator, GenerateFlowRequest};
pub use input_wait::{InputWaitCoordinator, WaitScope};
pub use orchestrator::{DriveOutcome, Orchestrator};
pub use run_log::RunLogger;
pub use scheduler::{ReconcileReport, TriggerScheduler};
pub use service::{FlowChart, FlowService};
