use thiserror::Error;

/// Errors raised by the stage graph and its storage
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// A task returned an error; carries the originating task id.
    #[error("Task '{task_id}' failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Re-entry is not allowed at task: {0}")]
    ReentryNotAllowed(String),

    #[error("Re-entry limit of {limit} rounds reached for session {session_id}")]
    ReentryLimitReached { session_id: String, limit: u32 },

    #[error("Storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, GraphError>;
