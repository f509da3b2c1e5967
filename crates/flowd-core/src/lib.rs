pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod step;
pub mod traits;
pub mod trigger;
pub mod types;

pub use call::{CallMetadata, CallOutcome, CorrelationKey, LlmCallRecord};
pub use config::AppConfig;
pub use error::{FlowdError, Result};
pub use event::{EventBus, FlowEvent};
pub use step::{AskScope, RunOutcome, Step, StepContext};
pub use status::{check_transition, effective_status, ActiveRunStatus};
pub use trigger::{parse_triggers, Trigger};
pub use types::*;
