use flow_graph::GraphError;
use thiserror::Error;

/// Errors surfaced to callers of the pipeline.
///
/// External service failures never appear here: stages recover from them
/// with their deterministic fallbacks.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing required credential or invalid settings; nothing ran.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error escaped every fallback; no report was produced.
    #[error("Stage '{stage}' failed: {message}")]
    Fatal { stage: String, message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Feedback rejected: {0}")]
    ReentryNotSupported(String),

    #[error(transparent)]
    Graph(GraphError),

    #[error("Session cache error: {0}")]
    Cache(#[from] std::io::Error),
}

impl From<GraphError> for PipelineError {
    fn from(error: GraphError) -> Self {
        match error {
            GraphError::TaskFailed { task_id, message } => PipelineError::Fatal {
                stage: task_id,
                message,
            },
            GraphError::SessionNotFound(id) => PipelineError::SessionNotFound(id),
            GraphError::ReentryNotAllowed(task) => PipelineError::ReentryNotSupported(format!(
                "this pipeline does not accept feedback at '{task}'"
            )),
            GraphError::ReentryLimitReached { session_id, limit } => {
                PipelineError::ReentryNotSupported(format!(
                    "session {session_id} already used its {limit} feedback round(s)"
                ))
            }
            other => PipelineError::Graph(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_failures_carry_the_stage() {
        let error = PipelineError::from(GraphError::TaskFailed {
            task_id: "report_compose".to_string(),
            message: "boom".to_string(),
        });
        assert!(matches!(
            error,
            PipelineError::Fatal { ref stage, .. } if stage == "report_compose"
        ));
        assert_eq!(error.to_string(), "Stage 'report_compose' failed: boom");
    }
}
