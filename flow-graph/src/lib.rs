pub mod context;
pub mod error;
pub mod graph;
pub mod runner;
pub mod storage;
pub mod task;

// Re-export commonly used types
pub use context::Context;
pub use error::{GraphError, Result};
pub use graph::{ExecutionResult, ExecutionStatus, Graph, GraphBuilder};
pub use runner::FlowRunner;
pub use storage::{
    GraphStorage, InMemoryGraphStorage, InMemorySessionStorage, Session, SessionStorage,
};
pub use task::{NextAction, Task, TaskResult};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Appends its id to the "trace" list and continues.
    struct TraceTask {
        id: String,
        fail: bool,
    }

    impl TraceTask {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Task for TraceTask {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, context: Context) -> Result<TaskResult> {
            if self.fail {
                return Err(GraphError::TaskExecutionFailed("boom".to_string()));
            }
            let mut trace: Vec<String> = context.get("trace").await.unwrap_or_default();
            trace.push(self.id.clone());
            context.set("trace", trace).await?;
            Ok(TaskResult::new(None, NextAction::ContinueAndExecute))
        }
    }

    /// Records its id and answers with a fixed action. With `wait`, it parks
    /// until "input" is in the context.
    struct StepTask {
        id: String,
        action: NextAction,
        wait: bool,
    }

    impl StepTask {
        fn new(id: &str, action: NextAction) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                action,
                wait: false,
            })
        }

        fn waiting(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                action: NextAction::ContinueAndExecute,
                wait: true,
            })
        }
    }

    #[async_trait]
    impl Task for StepTask {
        fn id(&self) -> &str {
            &self.id
        }

        async fn run(&self, context: Context) -> Result<TaskResult> {
            if self.wait && !context.contains("input") {
                return Ok(TaskResult::new(None, NextAction::WaitForInput));
            }
            let mut trace: Vec<String> = context.get("trace").await.unwrap_or_default();
            trace.push(self.id.clone());
            context.set("trace", trace).await?;
            Ok(TaskResult::new(Some(self.id.clone()), self.action.clone()))
        }
    }

    fn diamond() -> Graph {
        // a -> b -> c -> d, and e joins {b, d}
        GraphBuilder::new("diamond")
            .add_task(TraceTask::new("a"))
            .add_task(TraceTask::new("b"))
            .add_task(TraceTask::new("c"))
            .add_task(TraceTask::new("d"))
            .add_task(TraceTask::new("e"))
            .add_edge("a", "b")
            .add_edge("b", "c")
            .add_edge("c", "d")
            .add_join("e", ["b", "d"])
            .allow_reentry("c")
            .max_rounds(1)
            .build()
    }

    async fn trace(session: &Session) -> Vec<String> {
        session.context.get("trace").await.unwrap_or_default()
    }

    #[tokio::test]
    async fn test_simple_graph_execution() {
        let graph = GraphBuilder::new("single").add_task(TraceTask::new("only")).build();
        let mut session = Session::new_from_task("s".to_string(), "only");

        let result = graph.execute_session(&mut session).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.executed, vec!["only"]);
        assert!(session.is_finished());
        assert_eq!(trace(&session).await, vec!["only"]);
    }

    #[tokio::test]
    async fn join_waits_for_every_dependency() {
        let graph = diamond();
        graph.validate().unwrap();
        let mut session = Session::new_from_task("s".to_string(), "a");

        let result = graph.execute_session(&mut session).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.executed.len(), 5);
        // e is queued after b but must not run before d
        assert_eq!(trace(&session).await, vec!["a", "b", "c", "d", "e"]);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn reentry_reruns_only_downstream_tasks() {
        let graph = diamond();
        let mut session = Session::new_from_task("s".to_string(), "a");
        graph.execute_session(&mut session).await.unwrap();

        graph.reenter(&mut session, "c").unwrap();
        graph.execute_session(&mut session).await.unwrap();

        assert_eq!(
            trace(&session).await,
            vec!["a", "b", "c", "d", "e", "c", "d", "e"]
        );
        assert_eq!(session.rounds, 1);
    }

    #[tokio::test]
    async fn reentry_is_bounded_and_designated() {
        let graph = diamond();
        let mut session = Session::new_from_task("s".to_string(), "a");
        graph.execute_session(&mut session).await.unwrap();

        assert!(matches!(
            graph.reenter(&mut session, "b"),
            Err(GraphError::ReentryNotAllowed(_))
        ));
        graph.reenter(&mut session, "c").unwrap();
        assert!(matches!(
            graph.reenter(&mut session, "c"),
            Err(GraphError::ReentryLimitReached { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn continue_yields_between_tasks() {
        let graph = GraphBuilder::new("steps")
            .add_task(StepTask::new("a", NextAction::Continue))
            .add_task(StepTask::new("b", NextAction::Continue))
            .add_edge("a", "b")
            .build();
        let mut session = Session::new_from_task("s".to_string(), "a");

        let first = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::WaitingForInput);
        assert_eq!(first.response.as_deref(), Some("a"));

        let second = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Completed);
        assert_eq!(trace(&session).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn wait_for_input_parks_the_task() {
        let graph = GraphBuilder::new("wait")
            .add_task(StepTask::waiting("ask"))
            .add_task(TraceTask::new("after"))
            .add_edge("ask", "after")
            .build();
        let mut session = Session::new_from_task("s".to_string(), "ask");

        let parked = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(parked.status, ExecutionStatus::WaitingForInput);
        assert_eq!(session.pending.front().map(String::as_str), Some("ask"));

        session.context.set("input", "yes").await.unwrap();
        let done = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(trace(&session).await, vec!["ask", "after"]);
    }

    #[tokio::test]
    async fn goto_jumps_and_conditional_edges_filter() {
        let graph = GraphBuilder::new("branch")
            .add_task(StepTask::new("start", NextAction::ContinueAndExecute))
            .add_task(TraceTask::new("yes"))
            .add_task(TraceTask::new("no"))
            .add_task(StepTask::new("jump", NextAction::GoTo("no".to_string())))
            .add_conditional_edge("start", "yes", |ctx| ctx.contains("flag"))
            .add_conditional_edge("start", "no", |ctx| !ctx.contains("flag"))
            .set_start_task("start")
            .build();
        graph.validate().unwrap();
        assert_eq!(graph.start_task_id().as_deref(), Some("start"));

        let mut session = Session::new_from_task("s".to_string(), "start");
        session.context.set("flag", true).await.unwrap();
        graph.execute_session(&mut session).await.unwrap();
        assert_eq!(trace(&session).await, vec!["start", "yes"]);

        let mut session = Session::new_from_task("s2".to_string(), "jump");
        let result = graph.execute_session(&mut session).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::WaitingForInput);
        graph.execute_session(&mut session).await.unwrap();
        assert_eq!(trace(&session).await, vec!["jump", "no"]);
    }

    #[test]
    fn cycles_fail_validation() {
        let graph = GraphBuilder::new("cycle")
            .add_task(TraceTask::new("a"))
            .add_task(TraceTask::new("b"))
            .add_edge("a", "b")
            .add_edge("b", "a")
            .build();
        assert!(matches!(graph.validate(), Err(GraphError::InvalidGraph(_))));
    }

    #[test]
    fn unknown_join_dependency_fails_validation() {
        let graph = GraphBuilder::new("join")
            .add_task(TraceTask::new("a"))
            .add_join("a", ["ghost"])
            .build();
        assert!(graph.validate().is_err());
    }

    #[tokio::test]
    async fn task_failure_names_the_task() {
        let graph = GraphBuilder::new("fails")
            .add_task(TraceTask::new("a"))
            .add_task(TraceTask::failing("b"))
            .add_edge("a", "b")
            .build();
        let mut session = Session::new_from_task("s".to_string(), "a");

        let err = graph.execute_session(&mut session).await.unwrap_err();

        match err {
            GraphError::TaskFailed { task_id, message } => {
                assert_eq!(task_id, "b");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_storage() {
        let graph_storage = InMemoryGraphStorage::new();
        let session_storage = InMemorySessionStorage::new();

        graph_storage
            .save("g".to_string(), Arc::new(diamond()))
            .await
            .unwrap();
        assert!(graph_storage.get("g").await.unwrap().is_some());
        graph_storage.delete("g").await.unwrap();
        assert!(graph_storage.get("g").await.unwrap().is_none());

        session_storage
            .save(Session::new_from_task("session1".to_string(), "a"))
            .await
            .unwrap();
        let retrieved = session_storage.get("session1").await.unwrap();
        assert_eq!(retrieved.unwrap().pending.len(), 1);
    }

    #[tokio::test]
    async fn runner_persists_and_resumes() {
        let storage = Arc::new(InMemorySessionStorage::new());
        let runner = FlowRunner::new(Arc::new(diamond()), storage.clone());
        storage
            .save(Session::new_from_task("s1".to_string(), "a"))
            .await
            .unwrap();

        runner.run("s1").await.unwrap();
        runner.resume_at("s1", "c").await.unwrap();

        let session = storage.get("s1").await.unwrap().unwrap();
        assert_eq!(trace(&session).await.len(), 8);
        assert!(matches!(
            runner.run("missing").await,
            Err(GraphError::SessionNotFound(_))
        ));
    }
}
