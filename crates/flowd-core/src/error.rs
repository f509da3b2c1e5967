use thiserror::Error;

use crate::types::Status;

#[derive(Debug, Error)]
pub enum FlowdError {
    // Trigger errors
    #[error("Invalid trigger format: {input}: {reason}")]
    InvalidTriggerFormat { input: String, reason: String },

    #[error("Trigger fired for flow {flow_id} which is no longer active")]
    SchedulingRace { flow_id: String },

    // LLM errors
    #[error("Provider failure on model {model}: {message}")]
    ProviderFailure { model: String, message: String },

    #[error("All models exhausted after {attempts} attempt(s): {last_error}")]
    EnsembleExhausted { attempts: u32, last_error: String },

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // State machine errors
    #[error("Input wait {got} does not match the pending wait on {scope}")]
    StaleInputWait { scope: String, got: String },

    #[error("{entity} {id} is already {from} and cannot move to {to}")]
    TerminalStateViolation {
        entity: &'static str,
        id: String,
        from: Status,
        to: Status,
    },

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: Status,
        to: Status,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowdError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_trigger(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTriggerFormat {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowdError>;
