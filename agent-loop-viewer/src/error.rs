//! Error types for the agent-loop-viewer application.

use thiserror::Error;

/// Errors that can occur in the agent-loop-viewer application
#[derive(Error, Debug)]
pub enum ViewerError {
    /// Failed to read a file
    #[error("failed to read file: {0}")]
    FileReadError(#[from] std::io::Error),

    /// Failed to parse JSON
    #[error("JSON parse error: {0}")]
    JsonParseError(#[from] serde_json::Error),

    /// The loop's own files could not be read
    #[error(transparent)]
    LoopFiles(#[from] agent_loop::LoopError),

    /// Loop not found
    #[error("loop not found: {0}")]
    LoopNotFound(String),

    /// No loops available
    #[error("no loops found in {0}")]
    NoLoopsAvailable(String),

    /// User cancelled selection
    #[error("user cancelled")]
    UserCancelled,

    /// File watcher error
    #[error("file watcher error: {0}")]
    WatcherError(String),
}

/// Result type alias for viewer operations
pub type Result<T> = std::result::Result<T, ViewerError>;
