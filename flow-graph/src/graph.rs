use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::{
    context::Context,
    error::{GraphError, Result},
    storage::Session,
    task::{NextAction, Task, TaskResult},
};

/// Re-entry rounds allowed per session unless the builder says otherwise
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Predicate over the session context deciding whether an edge is taken
pub type EdgeCondition = Arc<dyn Fn(&Context) -> bool + Send + Sync>;

/// Edge between tasks in the graph
#[derive(Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub condition: Option<EdgeCondition>,
}

/// A graph of tasks that can be executed.
///
/// Besides plain edges a task may be declared a *join*: it only runs once
/// every one of its dependencies has completed. Tasks may also be marked as
/// re-entry points, the only places where a finished session can be rewound.
pub struct Graph {
    pub id: String,
    tasks: HashMap<String, Arc<dyn Task>>,
    task_order: Vec<String>,
    edges: Vec<Edge>,
    joins: HashMap<String, Vec<String>>,
    reentry_points: HashSet<String>,
    max_rounds: u32,
    start_task_id: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: HashMap::new(),
            task_order: Vec::new(),
            edges: Vec::new(),
            joins: HashMap::new(),
            reentry_points: HashSet::new(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            start_task_id: None,
        }
    }

    /// Add a task to the graph; the first task added becomes the start task
    pub fn add_task(&mut self, task: Arc<dyn Task>) -> &mut Self {
        let task_id = task.id().to_string();
        if self.start_task_id.is_none() {
            self.start_task_id = Some(task_id.clone());
        }
        if self.tasks.insert(task_id.clone(), task).is_none() {
            self.task_order.push(task_id);
        }
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Edge taken only when `condition` holds for the context at the time
    /// `from` finishes.
    pub fn add_conditional_edge<F>(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> &mut Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Override the start task; unknown ids are ignored.
    pub fn set_start_task(&mut self, task_id: impl Into<String>) -> &mut Self {
        let task_id = task_id.into();
        if self.tasks.contains_key(&task_id) {
            self.start_task_id = Some(task_id);
        }
        self
    }

    /// Declare `task_id` as a join over `dependencies` and wire an edge from
    /// each dependency to it.
    pub fn add_join<I, S>(&mut self, task_id: impl Into<String>, dependencies: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let task_id = task_id.into();
        let dependencies: Vec<String> = dependencies.into_iter().map(Into::into).collect();
        for dependency in &dependencies {
            self.add_edge(dependency.clone(), task_id.clone());
        }
        self.joins.insert(task_id, dependencies);
        self
    }

    pub fn allow_reentry(&mut self, task_id: impl Into<String>) -> &mut Self {
        self.reentry_points.insert(task_id.into());
        self
    }

    pub fn set_max_rounds(&mut self, max_rounds: u32) -> &mut Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Check that every edge, join and re-entry point names a known task and
    /// that the edges form a DAG.
    pub fn validate(&self) -> Result<()> {
        let start = self
            .start_task_id
            .as_ref()
            .ok_or_else(|| GraphError::InvalidGraph("graph has no tasks".to_string()))?;
        if !self.tasks.contains_key(start) {
            return Err(GraphError::TaskNotFound(start.clone()));
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !self.tasks.contains_key(end) {
                    return Err(GraphError::InvalidGraph(format!(
                        "edge {} -> {} references unknown task {}",
                        edge.from, edge.to, end
                    )));
                }
            }
        }
        for (join, dependencies) in &self.joins {
            for dependency in std::iter::once(join).chain(dependencies) {
                if !self.tasks.contains_key(dependency) {
                    return Err(GraphError::InvalidGraph(format!(
                        "join {join} references unknown task {dependency}"
                    )));
                }
            }
        }
        if let Some(unknown) = self
            .reentry_points
            .iter()
            .find(|t| !self.tasks.contains_key(*t))
        {
            return Err(GraphError::InvalidGraph(format!(
                "re-entry point {unknown} is not a task"
            )));
        }

        // Kahn's algorithm
        let mut in_degree: HashMap<&str, usize> =
            self.task_order.iter().map(|t| (t.as_str(), 0)).collect();
        for edge in &self.edges {
            *in_degree.entry(edge.to.as_str()).or_default() += 1;
        }
        let mut ready: VecDeque<&str> = self
            .task_order
            .iter()
            .map(String::as_str)
            .filter(|t| in_degree.get(t) == Some(&0))
            .collect();
        let mut visited = 0;
        while let Some(task) = ready.pop_front() {
            visited += 1;
            for edge in self.edges.iter().filter(|e| e.from == task) {
                if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(edge.to.as_str());
                    }
                }
            }
        }
        if visited != self.task_order.len() {
            return Err(GraphError::InvalidGraph(format!(
                "graph {} contains a cycle",
                self.id
            )));
        }
        Ok(())
    }

    /// Run queued tasks of the session until the graph finishes or a task
    /// hands control back to the caller.
    pub async fn execute_session(&self, session: &mut Session) -> Result<ExecutionResult> {
        let mut last_response = None;
        let mut executed = Vec::new();

        while let Some(task_id) = session.pending.pop_front() {
            if session.is_completed(&task_id) {
                continue;
            }
            if !self.dependencies_met(&task_id, session) {
                // Re-queued by the edge from whichever dependency finishes last
                debug!(session_id = %session.id, task_id = %task_id, "join not ready yet");
                continue;
            }

            let result = self
                .execute_single_task(&task_id, session.context.clone())
                .await?;
            session.current_task_id = task_id.clone();
            session.status_message = result.status_message.clone();
            executed.push(task_id.clone());
            if result.response.is_some() {
                last_response = result.response;
            }

            let status = match result.next_action {
                NextAction::WaitForInput => {
                    // parked: runs again on the next call
                    session.pending.push_front(task_id);
                    ExecutionStatus::WaitingForInput
                }
                NextAction::End => {
                    session.completed.push(task_id);
                    session.pending.clear();
                    ExecutionStatus::Completed
                }
                NextAction::GoTo(target_id) => {
                    if !self.tasks.contains_key(&target_id) {
                        return Err(GraphError::TaskNotFound(target_id));
                    }
                    session.completed.push(task_id);
                    session.completed.retain(|t| *t != target_id);
                    session.pending.push_front(target_id);
                    ExecutionStatus::WaitingForInput
                }
                action @ (NextAction::Continue | NextAction::ContinueAndExecute) => {
                    for next in self.find_next_tasks(&task_id, &session.context) {
                        if !session.is_completed(&next) && !session.pending.contains(&next) {
                            session.pending.push_back(next);
                        }
                    }
                    session.completed.push(task_id);
                    if action == NextAction::ContinueAndExecute || session.pending.is_empty() {
                        continue;
                    }
                    ExecutionStatus::WaitingForInput
                }
            };

            return Ok(ExecutionResult {
                response: last_response,
                status,
                executed,
            });
        }

        Ok(ExecutionResult {
            response: last_response,
            status: ExecutionStatus::Completed,
            executed,
        })
    }

    /// Rewind a session to a designated re-entry point: the task and every
    /// task downstream of it are cleared from the completed set and the task
    /// is queued again.
    pub fn reenter(&self, session: &mut Session, task_id: &str) -> Result<()> {
        if !self.reentry_points.contains(task_id) {
            return Err(GraphError::ReentryNotAllowed(task_id.to_string()));
        }
        if session.rounds >= self.max_rounds {
            return Err(GraphError::ReentryLimitReached {
                session_id: session.id.clone(),
                limit: self.max_rounds,
            });
        }

        let mut reset = self.descendants(task_id);
        reset.insert(task_id.to_string());
        session.completed.retain(|t| !reset.contains(t));
        session.pending.retain(|t| !reset.contains(t));
        session.pending.push_front(task_id.to_string());
        session.current_task_id = task_id.to_string();
        session.rounds += 1;

        debug!(
            session_id = %session.id,
            task_id = %task_id,
            round = session.rounds,
            reset = reset.len(),
            "session rewound"
        );
        Ok(())
    }

    /// Execute a single task and tag the result with its id
    async fn execute_single_task(&self, task_id: &str, context: Context) -> Result<TaskResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;

        let mut result = task.run(context).await.map_err(|e| match e {
            failed @ GraphError::TaskFailed { .. } => failed,
            other => GraphError::TaskFailed {
                task_id: task_id.to_string(),
                message: other.to_string(),
            },
        })?;
        result.task_id = task_id.to_string();
        Ok(result)
    }

    fn dependencies_met(&self, task_id: &str, session: &Session) -> bool {
        self.joins
            .get(task_id)
            .is_none_or(|deps| deps.iter().all(|d| session.is_completed(d)))
    }

    /// Successors whose edge condition holds, in insertion order
    pub fn find_next_tasks(&self, current_task_id: &str, context: &Context) -> Vec<String> {
        self.edges
            .iter()
            .filter(|edge| edge.from == current_task_id)
            .filter(|edge| edge.condition.as_ref().is_none_or(|condition| condition(context)))
            .map(|edge| edge.to.clone())
            .collect()
    }

    /// Every task reachable from `task_id`, ignoring edge conditions
    pub fn descendants(&self, task_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([task_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.from == current) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        seen
    }

    pub fn start_task_id(&self) -> Option<String> {
        self.start_task_id.clone()
    }

    pub fn join_dependencies(&self, task_id: &str) -> Option<&[String]> {
        self.joins.get(task_id).map(Vec::as_slice)
    }
}

/// Builder for creating graphs
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            graph: Graph::new(id),
        }
    }

    pub fn add_task(mut self, task: Arc<dyn Task>) -> Self {
        self.graph.add_task(task);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.graph.add_edge(from, to);
        self
    }

    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.graph.add_conditional_edge(from, to, condition);
        self
    }

    pub fn add_join<I, S>(mut self, task_id: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.graph.add_join(task_id, dependencies);
        self
    }

    pub fn allow_reentry(mut self, task_id: impl Into<String>) -> Self {
        self.graph.allow_reentry(task_id);
        self
    }

    pub fn max_rounds(mut self, max_rounds: u32) -> Self {
        self.graph.set_max_rounds(max_rounds);
        self
    }

    pub fn set_start_task(mut self, task_id: impl Into<String>) -> Self {
        self.graph.set_start_task(task_id);
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Outcome of one `execute_session` call
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Last response any task produced
    pub response: Option<String>,
    pub status: ExecutionStatus,
    /// Tasks that ran during this call, in order
    pub executed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// A task handed control back; call again to continue
    WaitingForInput,
    /// Nothing left to run
    Completed,
}
