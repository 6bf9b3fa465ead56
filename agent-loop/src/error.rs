use thiserror::Error;

use crate::state::LoopState;

/// Errors that can occur while driving an agent loop
#[derive(Error, Debug)]
pub enum LoopError {
    /// Invalid or missing configuration at start; the loop never runs
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The agent session could not be opened
    #[error("agent bridge unavailable: {0}")]
    BridgeUnavailable(String),

    /// The agent session terminated abnormally mid-turn
    #[error("agent session crashed: {0}")]
    SessionCrash(String),

    /// A durable state write failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A registry entry references a loop whose owner is gone
    #[error("stale loop detected: {0}")]
    StaleLoop(String),

    /// No loop with that name exists in the working directory
    #[error("loop not found: {0}")]
    LoopNotFound(String),

    /// The loop is still active and the operation needs it terminated
    #[error("loop is still active: {0}")]
    LoopActive(String),

    /// Attempted a lifecycle transition the state machine forbids
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: LoopState, to: LoopState },

    /// Error communicating with the agent subprocess
    #[error("process I/O error: {0}")]
    ProcessIo(#[source] std::io::Error),

    /// Error parsing JSON from the agent or from disk
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// Filesystem error outside the state writes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LoopError {
    fn from(err: serde_json::Error) -> Self {
        LoopError::JsonParse(err.to_string())
    }
}

/// Result type alias for loop engine operations
pub type Result<T> = std::result::Result<T, LoopError>;
