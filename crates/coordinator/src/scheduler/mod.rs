//! Dependency-aware task scheduling
//!
//! The scheduler owns the dependency topology and every task record. Status
//! transitions are driven from outside (the coordinator) through the methods
//! below; readiness is recomputed only when a dependency completes.

pub mod graph;

pub use graph::DependencyGraph;

use ai_agent_common::error::Result;
use ai_agent_common::{CoordinationError, NewTask, Task, TaskId, TaskStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Order in which ready tasks are handed out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityOrder {
    /// Highest priority first
    #[default]
    Descending,
    Ascending,
}

#[derive(Default)]
struct SchedulerState {
    graph: DependencyGraph,
    tasks: HashMap<TaskId, Task>,
    next_seq: u64,
}

impl SchedulerState {
    fn get_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CoordinationError::not_found("task", id))
    }

    fn dependencies_completed(&self, id: &TaskId) -> bool {
        self.graph.dependencies(id).iter().all(|dep| {
            self.tasks
                .get(dep)
                .map_or(false, |t| t.status == TaskStatus::Completed)
        })
    }

    fn waiting_status(&self, id: &TaskId) -> TaskStatus {
        if self.dependencies_completed(id) {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        }
    }

    /// Move `id` between statuses, rejecting anything not in `from`
    fn transition(&mut self, id: &TaskId, from: &[TaskStatus], to: TaskStatus) -> Result<&mut Task> {
        let task = self.get_mut(id)?;
        if !from.contains(&task.status) {
            return Err(CoordinationError::invalid_transition(task.status, to));
        }
        task.set_status(to);
        Ok(task)
    }
}

/// Task registry plus dependency graph behind one reader-friendly lock
pub struct TaskScheduler {
    state: RwLock<SchedulerState>,
    /// Skips per +1 effective priority; 0 disables aging
    aging_ticks: u32,
}

impl TaskScheduler {
    pub fn new(aging_ticks: u32) -> Self {
        Self {
            state: RwLock::new(SchedulerState::default()),
            aging_ticks,
        }
    }

    /// Register a task and its dependency edges.
    ///
    /// Every edge is checked before anything is inserted, so a rejected task
    /// leaves the graph exactly as it was.
    #[instrument(skip(self, new), fields(task_id = tracing::field::Empty))]
    pub async fn add_task(&self, new: NewTask) -> Result<Task> {
        let mut state = self.state.write().await;

        let id = new.id.clone().unwrap_or_else(TaskId::generate);
        tracing::Span::current().record("task_id", id.as_str());
        if state.tasks.contains_key(&id) {
            return Err(CoordinationError::AlreadyExists {
                kind: "task".into(),
                id: id.to_string(),
            });
        }

        let mut deps: Vec<TaskId> = Vec::with_capacity(new.depends_on.len());
        for dep in &new.depends_on {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        if let Some(dep) = deps.iter().find(|dep| state.graph.would_cycle(&id, dep)) {
            warn!("Rejecting {}: depending on {} would close a cycle", id, dep);
            return Err(CoordinationError::cycle(&id, dep));
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        state.graph.ensure_node(&id);
        for dep in &deps {
            state.graph.add_edge(&id, dep);
        }

        let mut task = Task::from_new(
            NewTask {
                id: Some(id.clone()),
                depends_on: deps,
                ..new
            },
            seq,
        );
        task.status = state.waiting_status(&id);

        debug!("Task {} registered as {}", id, task.status);
        state.tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Add one edge to a task that has not been dispatched yet
    pub async fn add_dependency(&self, task: &TaskId, dependency: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;

        let status = state
            .tasks
            .get(task)
            .map(|t| t.status)
            .ok_or_else(|| CoordinationError::not_found("task", task))?;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
            return Err(CoordinationError::InvalidRequest(format!(
                "cannot add a dependency to {} task {}",
                status, task
            )));
        }
        if state.graph.would_cycle(task, dependency) {
            return Err(CoordinationError::cycle(task, dependency));
        }

        if !state.graph.has_edge(task, dependency) {
            state.graph.add_edge(task, dependency);
        }
        let waiting = state.waiting_status(task);
        let record = state.get_mut(task)?;
        if !record.depends_on.contains(dependency) {
            record.depends_on.push(dependency.clone());
        }
        if record.status != waiting {
            record.set_status(waiting);
        }
        Ok(record.clone())
    }

    /// Mark `id` completed and return the dependents that became ready
    pub async fn mark_completed(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        self.mark_completed_with(id, None).await
    }

    #[instrument(skip(self, result))]
    pub async fn mark_completed_with(&self, id: &TaskId, result: Option<String>) -> Result<Vec<TaskId>> {
        let mut state = self.state.write().await;

        let task = state.get_mut(id)?;
        match task.status {
            TaskStatus::Completed => return Ok(Vec::new()),
            TaskStatus::Failed => {
                return Err(CoordinationError::invalid_transition(
                    TaskStatus::Failed,
                    TaskStatus::Completed,
                ))
            }
            _ => {}
        }
        task.set_status(TaskStatus::Completed);
        if result.is_some() {
            task.result = result;
        }

        let candidates: Vec<TaskId> = state
            .graph
            .dependents(id)
            .into_iter()
            .filter(|dep| {
                state
                    .tasks
                    .get(dep)
                    .map_or(false, |t| t.status == TaskStatus::Pending)
            })
            .filter(|dep| state.dependencies_completed(dep))
            .collect();

        let mut ready = Vec::with_capacity(candidates.len());
        for dep in candidates {
            let task = state.get_mut(&dep)?;
            task.set_status(TaskStatus::Ready);
            ready.push((task.seq, dep));
        }
        ready.sort();

        let ready: Vec<TaskId> = ready.into_iter().map(|(_, id)| id).collect();
        info!("Task {} completed, {} dependents ready", id, ready.len());
        Ok(ready)
    }

    /// Up to `limit` ready tasks, highest effective priority first
    pub async fn next_ready(&self, limit: usize) -> Vec<Task> {
        self.next_ready_ordered(limit, PriorityOrder::Descending).await
    }

    pub async fn next_ready_ordered(&self, limit: usize, order: PriorityOrder) -> Vec<Task> {
        let state = self.state.read().await;
        let mut ready: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();

        ready.sort_by(|a, b| {
            let (pa, pb) = (self.effective_priority(a), self.effective_priority(b));
            let by_priority = match order {
                PriorityOrder::Descending => pb.cmp(&pa),
                PriorityOrder::Ascending => pa.cmp(&pb),
            };
            by_priority.then(a.seq.cmp(&b.seq))
        });

        ready.into_iter().take(limit).cloned().collect()
    }

    /// Priority plus aging credit for lock-conflict skips
    pub fn effective_priority(&self, task: &Task) -> i64 {
        let aging = if self.aging_ticks == 0 {
            0
        } else {
            i64::from(task.skipped / self.aging_ticks)
        };
        i64::from(task.priority) + aging
    }

    /// Fail `id`; with `propagate` every non-terminal transitive dependent
    /// fails too. Returns the cascaded ids.
    #[instrument(skip(self, reason))]
    pub async fn mark_failed(&self, id: &TaskId, propagate: bool, reason: &str) -> Result<Vec<TaskId>> {
        let mut state = self.state.write().await;

        let task = state.get_mut(id)?;
        match task.status {
            TaskStatus::Failed => return Ok(Vec::new()),
            TaskStatus::Completed => {
                return Err(CoordinationError::invalid_transition(
                    TaskStatus::Completed,
                    TaskStatus::Failed,
                ))
            }
            _ => {}
        }
        task.set_status(TaskStatus::Failed);
        task.failure = Some(reason.to_string());
        warn!("Task {} failed: {}", id, reason);

        if !propagate {
            return Ok(Vec::new());
        }

        let mut cascaded = Vec::new();
        for dependent in state.graph.transitive_dependents(id) {
            if let Some(task) = state.tasks.get_mut(&dependent) {
                if !task.status.is_terminal() {
                    task.set_status(TaskStatus::Failed);
                    task.failure = Some(format!("dependency {} failed: {}", id, reason));
                    cascaded.push(dependent);
                }
            }
        }
        if !cascaded.is_empty() {
            info!("Failure of {} cascaded to {} tasks", id, cascaded.len());
        }
        Ok(cascaded)
    }

    /// Put a failed task back into the queue
    pub async fn retry(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;
        let waiting = state.waiting_status(id);
        let task = state.transition(id, &[TaskStatus::Failed], waiting)?;
        task.failure = None;
        task.assigned_agent = None;
        task.restarts = 0;
        task.skipped = 0;
        info!("Task {} re-queued as {}", id, waiting);
        Ok(task.clone())
    }

    pub async fn mark_assigned(&self, id: &TaskId, agent: &str) -> Result<Task> {
        let mut state = self.state.write().await;
        let task = state.transition(id, &[TaskStatus::Ready], TaskStatus::Assigned)?;
        task.assigned_agent = Some(agent.to_string());
        Ok(task.clone())
    }

    pub async fn mark_running(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;
        let task = state.transition(
            id,
            &[TaskStatus::Assigned, TaskStatus::Stuck, TaskStatus::Running],
            TaskStatus::Running,
        )?;
        Ok(task.clone())
    }

    pub async fn mark_stuck(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;
        let task = state.transition(id, &[TaskStatus::Running], TaskStatus::Stuck)?;
        Ok(task.clone())
    }

    /// Return an in-flight task to the ready queue, unassigned
    pub async fn requeue(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;
        let waiting = state.waiting_status(id);
        let task = state.transition(
            id,
            &[TaskStatus::Assigned, TaskStatus::Running, TaskStatus::Stuck],
            waiting,
        )?;
        task.assigned_agent = None;
        Ok(task.clone())
    }

    pub async fn record_restart(&self, id: &TaskId) -> Result<Task> {
        let mut state = self.state.write().await;
        let task = state.get_mut(id)?;
        task.restarts += 1;
        Ok(task.clone())
    }

    /// Count one lock-conflict skip; returns the new effective priority
    pub async fn note_skipped(&self, id: &TaskId) -> Result<i64> {
        let mut state = self.state.write().await;
        let task = state.get_mut(id)?;
        task.skipped += 1;
        Ok(self.effective_priority(task))
    }

    /// Reload persisted tasks; statuses are kept as stored
    pub async fn restore(&self, tasks: Vec<Task>) {
        let mut state = self.state.write().await;

        for task in &tasks {
            state.graph.ensure_node(&task.id);
            state.next_seq = state.next_seq.max(task.seq + 1);
        }
        for task in &tasks {
            for dep in &task.depends_on {
                if state.graph.would_cycle(&task.id, dep) {
                    warn!("Dropping persisted edge {} -> {}: cycle", task.id, dep);
                    continue;
                }
                state.graph.add_edge(&task.id, dep);
            }
        }
        let count = tasks.len();
        for task in tasks {
            state.tasks.insert(task.id.clone(), task);
        }
        info!("Restored {} tasks", count);
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        self.state.read().await.tasks.get(id).cloned()
    }

    /// All tasks in submission order
    pub async fn list_tasks(&self) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Completed and failed tasks
    pub async fn archived(&self) -> Vec<Task> {
        let mut tasks = self.list_tasks().await;
        tasks.retain(|t| t.status.is_terminal());
        tasks
    }

    pub async fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.state.read().await.graph.dependencies(id)
    }

    pub async fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.state.read().await.graph.dependents(id)
    }

    pub async fn edge_count(&self) -> usize {
        self.state.read().await.graph.edge_count()
    }

    pub async fn is_acyclic(&self) -> bool {
        self.state.read().await.graph.is_acyclic()
    }

    /// Whether every submitted task is completed or failed
    pub async fn all_terminal(&self) -> bool {
        self.state
            .read()
            .await
            .tasks
            .values()
            .all(|t| t.status.is_terminal())
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(0)
    }
}
