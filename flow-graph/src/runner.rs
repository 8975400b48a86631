//! Storage-backed execution: every call loads the session, drives the graph
//! and writes the session back, so callers only ever hold a session id.

use std::sync::Arc;

use tracing::info;

use crate::{
    error::{GraphError, Result},
    graph::{ExecutionResult, Graph},
    storage::SessionStorage,
};

/// Runs sessions of one graph against a [`SessionStorage`].
#[derive(Clone)]
pub struct FlowRunner {
    graph: Arc<Graph>,
    storage: Arc<dyn SessionStorage>,
}

impl FlowRunner {
    pub fn new(graph: Arc<Graph>, storage: Arc<dyn SessionStorage>) -> Self {
        Self { graph, storage }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Execute the session until it completes or yields, then persist it.
    pub async fn run(&self, session_id: &str) -> Result<ExecutionResult> {
        let mut session = self
            .storage
            .get(session_id)
            .await?
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        let result = self.graph.execute_session(&mut session).await;

        // Persist even on failure so the caller can inspect the partial state
        self.storage.save(session).await?;
        result
    }

    /// Rewind the session to `task_id` (a declared re-entry point) and run it
    /// again from there.
    pub async fn resume_at(&self, session_id: &str, task_id: &str) -> Result<ExecutionResult> {
        let mut session = self
            .storage
            .get(session_id)
            .await?
            .ok_or_else(|| GraphError::SessionNotFound(session_id.to_string()))?;

        self.graph.reenter(&mut session, task_id)?;
        info!(session_id = %session_id, task_id = %task_id, round = session.rounds, "resuming session");

        let result = self.graph.execute_session(&mut session).await;
        self.storage.save(session).await?;
        result
    }
}
