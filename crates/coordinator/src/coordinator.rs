//! Agent coordinator
//!
//! The AgentCoordinator is the orchestration state machine that:
//! - Hires and fires agents
//! - Dispatches ready tasks to idle agents that can lock every required file
//! - Polls worker sessions and feeds their progress into heartbeats
//! - Detects stuck tasks and drives nudge / restart / fail recovery
//! - Releases locks and unblocks dependents on completion or failure
//!
//! Lock order is always coordinator state, then scheduler or lock manager,
//! then resource pool.

use crate::audit::{AuditAction, AuditEvent, AuditLogger};
use crate::filelocks::FileLockManager;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatRecord};
use crate::scheduler::TaskScheduler;
use crate::session::{SessionHandle, WorkerBackend};
use crate::status_stream::{Notifier, StatusEvent, StatusStream};
use futures::future::join_all;
use ai_agent_common::error::Result;
use ai_agent_common::{
    Agent, AgentStatus, CoordinationError, CoordinatorConfig, FileLock, FirePolicy, LockRequest,
    LockRequestStatus, LockStatus, NewTask, RequestId, StateStore, SystemConfig, Task, TaskId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Recovery position of a running assignment
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Healthy,
    /// Marked stuck and nudged at `since`
    Stuck { since: Instant },
}

#[derive(Debug, Clone)]
struct Assignment {
    agent: String,
    handle: SessionHandle,
    /// Files locked for this task; locks the agent held beforehand stay out
    files: Vec<PathBuf>,
    phase: Phase,
    restarts: u32,
    /// Last note seen across restarts
    last_note: Option<String>,
}

#[derive(Default)]
struct CoordinatorState {
    agents: BTreeMap<String, Agent>,
    assignments: HashMap<TaskId, Assignment>,
    /// Restored in-flight tasks waiting for a fresh session
    orphans: Vec<TaskId>,
}

impl CoordinatorState {
    fn agent_mut(&mut self, name: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| CoordinationError::not_found("agent", name))
    }

    fn check_assignment(&self, agent: &str, task: &TaskId) -> Result<()> {
        if !self.agents.contains_key(agent) {
            return Err(CoordinationError::not_found("agent", agent));
        }
        match self.assignments.get(task) {
            Some(a) if a.agent == agent => Ok(()),
            Some(a) => Err(CoordinationError::InvalidRequest(format!(
                "task {} is assigned to {}, not {}",
                task, a.agent, agent
            ))),
            None => Err(CoordinationError::InvalidRequest(format!(
                "task {} has no running session",
                task
            ))),
        }
    }
}

/// What one [`AgentCoordinator::tick`] did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub dispatched: Vec<TaskId>,
}

/// Outcome of [`AgentCoordinator::restore`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreSummary {
    pub agents: usize,
    pub locks: usize,
    pub tasks: usize,
    /// In-flight tasks that will get a fresh session on the next tick
    pub resumed: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
}

pub struct AgentCoordinator {
    config: CoordinatorConfig,
    scheduler: Arc<TaskScheduler>,
    locks: Arc<FileLockManager>,
    heartbeats: HeartbeatMonitor,
    backend: Arc<dyn WorkerBackend>,
    store: Arc<dyn StateStore>,
    status_stream: Arc<StatusStream>,
    notifiers: Vec<Arc<dyn Notifier>>,
    state: Mutex<CoordinatorState>,
}

impl AgentCoordinator {
    pub fn new(
        config: &SystemConfig,
        backend: Arc<dyn WorkerBackend>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let coordinator = config.coordinator.clone();
        info!(
            "Initializing coordinator (tick {:?}, stuck after {:?})",
            coordinator.tick_interval(),
            coordinator.stuck_threshold()
        );

        Self {
            scheduler: Arc::new(TaskScheduler::new(coordinator.priority_aging_ticks)),
            locks: Arc::new(FileLockManager::new(&config.locks, Arc::clone(&store))),
            heartbeats: HeartbeatMonitor::new(coordinator.stuck_threshold()),
            backend,
            store,
            status_stream: Arc::new(StatusStream::new()),
            notifiers: Vec::new(),
            state: Mutex::new(CoordinatorState::default()),
            config: coordinator,
        }
    }

    /// Add a notification sink next to the built-in status stream
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_stream.subscribe()
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn locks(&self) -> Arc<FileLockManager> {
        Arc::clone(&self.locks)
    }

    #[instrument(skip(self))]
    pub async fn hire(&self, name: &str, role: &str) -> Result<Agent> {
        let mut state = self.state.lock().await;
        if state.agents.contains_key(name) {
            return Err(CoordinationError::AlreadyExists {
                kind: "agent".into(),
                id: name.to_string(),
            });
        }

        let agent = Agent::new(name, role);
        state.agents.insert(name.to_string(), agent.clone());
        self.persist_agent(&agent).await;

        info!("Hired {} as {}", name, role);
        self.notify(StatusEvent::agent_hired(name, role));
        AuditLogger::log(AuditEvent::new(AuditAction::AgentHired, name, role));
        Ok(agent)
    }

    /// Remove an agent: cancel its session, release every lock it holds and
    /// hand its task to the configured fire policy.
    #[instrument(skip(self))]
    pub async fn fire(&self, name: &str) -> Result<Option<TaskId>> {
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .remove(name)
            .ok_or_else(|| CoordinationError::not_found("agent", name))?;

        let task_id = agent.current_task.clone();
        if let Some(task_id) = &task_id {
            state.orphans.retain(|t| t != task_id);
            if let Some(assignment) = state.assignments.remove(task_id) {
                self.cancel_session(&assignment.handle).await;
            }
            self.heartbeats.remove(task_id);
        }

        let released = self.locks.release_files(name, None).await;
        debug!("Released {} files held by {}", released.len(), name);
        for request in self.locks.withdraw_requests(name).await {
            self.notify(StatusEvent::lock_request_resolved(&request));
        }

        if let Some(task_id) = &task_id {
            self.apply_fire_policy(name, task_id).await;
        }

        if let Err(e) = self.store.delete_agent(name).await {
            warn!("Failed to persist removal of {}: {:#}", name, e);
        }

        info!("Fired {}", name);
        self.notify(StatusEvent::agent_fired(name, task_id.as_ref()));
        AuditLogger::warn(
            AuditEvent::new(AuditAction::AgentFired, name, format!("released {} files", released.len()))
                .with_meta("policy", format!("{:?}", self.config.fire_policy)),
        );
        Ok(task_id)
    }

    async fn apply_fire_policy(&self, agent: &str, task_id: &TaskId) {
        let reason = format!("agent {} was fired", agent);
        let outcome = match self.config.fire_policy {
            FirePolicy::Requeue => self.scheduler.requeue(task_id).await.map(|_| Vec::new()),
            FirePolicy::Fail => self.scheduler.mark_failed(task_id, false, &reason).await,
            FirePolicy::FailCascade => self.scheduler.mark_failed(task_id, true, &reason).await,
        };

        match outcome {
            Ok(cascaded) => {
                self.persist_task_id(task_id).await;
                for id in &cascaded {
                    self.persist_task_id(id).await;
                }
                if self.config.fire_policy != FirePolicy::Requeue {
                    self.notify(StatusEvent::task_failed(task_id, Some(agent), &reason));
                }
            }
            Err(e) => warn!("Could not apply fire policy to {}: {}", task_id, e),
        }
    }

    /// Return an offline agent to the idle pool
    pub async fn bring_online(&self, name: &str) -> Result<Agent> {
        let mut state = self.state.lock().await;
        let agent = state.agent_mut(name)?;
        if agent.status != AgentStatus::Offline {
            return Err(CoordinationError::invalid_transition(agent.status, AgentStatus::Idle));
        }
        agent.status = AgentStatus::Idle;
        let agent = agent.clone();
        self.persist_agent(&agent).await;
        info!("{} is back online", name);
        Ok(agent)
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.state.lock().await.agents.values().cloned().collect()
    }

    pub async fn agent(&self, name: &str) -> Option<Agent> {
        self.state.lock().await.agents.get(name).cloned()
    }

    /// Register a task; cycles surface to the caller unchanged
    pub async fn submit_task(&self, task: NewTask) -> Result<Task> {
        let task = self.scheduler.add_task(task).await?;
        self.persist_task(&task).await;
        info!("Submitted {} ({}): {}", task.id, task.status, task.description);
        Ok(task)
    }

    pub async fn task_status(&self, id: &TaskId) -> Option<Task> {
        self.scheduler.task(id).await
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.scheduler.list_tasks().await
    }

    pub async fn all_tasks_terminal(&self) -> bool {
        self.scheduler.all_terminal().await
    }

    pub fn heartbeat(&self, task: &TaskId) -> Option<HeartbeatRecord> {
        self.heartbeats.get(task)
    }

    /// Operator re-queue of a failed task
    pub async fn retry_task(&self, id: &TaskId) -> Result<Task> {
        let task = self.scheduler.retry(id).await?;
        self.persist_task(&task).await;
        Ok(task)
    }

    /// One coordination pass: poll sessions, resume restored work, dispatch
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary> {
        let mut state = self.state.lock().await;
        let mut summary = TickSummary::default();

        let running: Vec<(TaskId, Assignment)> = state
            .assignments
            .iter()
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();

        for (task_id, assignment) in running {
            let poll = match self.backend.poll(&assignment.handle).await {
                Ok(poll) => poll,
                Err(e) => {
                    warn!("Polling session {} for {} failed: {:#}", assignment.handle.id, task_id, e);
                    self.heartbeats.report(&task_id, None, None);
                    continue;
                }
            };

            if let Some(error) = poll.error {
                match self.fail_with_cascade(&mut state, &task_id, &error).await {
                    Ok(_) => summary.failed.push(task_id),
                    Err(e) => warn!("Could not fail {}: {}", task_id, e),
                }
            } else if poll.done {
                match self.complete_locked(&mut state, &task_id, poll.result, false).await {
                    Ok(_) => summary.completed.push(task_id),
                    Err(e) => warn!("Could not complete {}: {}", task_id, e),
                }
            } else {
                self.progress_locked(&mut state, &task_id, poll.progress, poll.note.as_deref())
                    .await;
            }
        }

        self.resume_orphans(&mut state).await;
        summary.dispatched = self.dispatch(&mut state).await;

        if !summary.completed.is_empty() || !summary.failed.is_empty() || !summary.dispatched.is_empty() {
            debug!(
                "Tick: {} completed, {} failed, {} dispatched",
                summary.completed.len(),
                summary.failed.len(),
                summary.dispatched.len()
            );
        }
        Ok(summary)
    }

    /// Hand ready tasks to idle agents that can lock every required file
    async fn dispatch(&self, state: &mut CoordinatorState) -> Vec<TaskId> {
        let idle: Vec<String> = state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Idle && a.current_task.is_none())
            .map(|a| a.name.clone())
            .collect();
        if idle.is_empty() {
            return Vec::new();
        }

        let ready = self.scheduler.next_ready(usize::MAX).await;
        let mut taken: HashSet<TaskId> = HashSet::new();
        let mut skipped: HashSet<TaskId> = HashSet::new();
        let mut dispatched = Vec::new();

        for name in idle {
            let Some(agent) = state.agents.get(&name).cloned() else {
                continue;
            };

            for task in &ready {
                if taken.contains(&task.id) || !agent.can_take(task.role.as_deref()) {
                    continue;
                }

                let description = format!("task {}: {}", task.id, task.description);
                match self.locks.lock_all(&name, &task.files, &description).await {
                    Ok(newly) => {
                        taken.insert(task.id.clone());
                        if self.start_assignment(state, &agent, task, newly).await {
                            dispatched.push(task.id.clone());
                        }
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        debug!("Skipping {} for {}: {}", task.id, name, e);
                        if skipped.insert(task.id.clone()) {
                            if let Err(e) = self.scheduler.note_skipped(&task.id).await {
                                warn!("Could not age {}: {}", task.id, e);
                            }
                        }
                    }
                    Err(e) => warn!("Cannot lock files for {}: {}", task.id, e),
                }
            }
        }

        dispatched
    }

    /// Assign `task` to `agent` and start its session; files are already locked.
    ///
    /// Returns false when the backend refused the session.
    async fn start_assignment(
        &self,
        state: &mut CoordinatorState,
        agent: &Agent,
        task: &Task,
        files: Vec<PathBuf>,
    ) -> bool {
        let task = match self.scheduler.mark_assigned(&task.id, &agent.name).await {
            Ok(task) => task,
            Err(e) => {
                warn!("Could not assign {}: {}", task.id, e);
                self.locks.release_files(&agent.name, Some(&files)).await;
                return false;
            }
        };
        self.persist_task(&task).await;
        self.set_agent(state, &agent.name, AgentStatus::Working, Some(task.id.clone()))
            .await;

        match self.backend.start(agent, &task).await {
            Ok(handle) => {
                self.begin_running(state, &task, handle, files, 0, None).await;
                info!("Dispatched {} to {}", task.id, agent.name);
                self.notify(StatusEvent::task_assigned(&task.id, &agent.name));
                true
            }
            Err(e) => {
                self.abandon_start(state, &agent.name, &task, &files, &format!("{:#}", e))
                    .await;
                false
            }
        }
    }

    async fn begin_running(
        &self,
        state: &mut CoordinatorState,
        task: &Task,
        handle: SessionHandle,
        files: Vec<PathBuf>,
        restarts: u32,
        last_note: Option<String>,
    ) {
        match self.scheduler.mark_running(&task.id).await {
            Ok(task) => self.persist_task(&task).await,
            Err(e) => warn!("Could not mark {} running: {}", task.id, e),
        }
        self.heartbeats.start(&task.id);
        state.assignments.insert(
            task.id.clone(),
            Assignment {
                agent: handle.agent.clone(),
                files,
                handle,
                phase: Phase::Healthy,
                restarts,
                last_note,
            },
        );
    }

    /// The backend could not start a session: free the files, requeue the
    /// task and take the agent offline.
    async fn abandon_start(
        &self,
        state: &mut CoordinatorState,
        agent: &str,
        task: &Task,
        files: &[PathBuf],
        reason: &str,
    ) {
        error!("Backend failed to start {} on {}: {}", task.id, agent, reason);
        state.assignments.remove(&task.id);
        self.heartbeats.remove(&task.id);
        self.locks.release_files(agent, Some(files)).await;

        match self.scheduler.requeue(&task.id).await {
            Ok(task) => self.persist_task(&task).await,
            Err(e) => warn!("Could not requeue {}: {}", task.id, e),
        }
        self.set_agent(state, agent, AgentStatus::Offline, None).await;
    }

    async fn resume_orphans(&self, state: &mut CoordinatorState) {
        for task_id in std::mem::take(&mut state.orphans) {
            let Some(task) = self.scheduler.task(&task_id).await else {
                continue;
            };
            let agent = task
                .assigned_agent
                .as_ref()
                .and_then(|name| state.agents.get(name))
                .filter(|a| a.status != AgentStatus::Offline)
                .cloned();

            let Some(agent) = agent else {
                match self.scheduler.requeue(&task_id).await {
                    Ok(task) => self.persist_task(&task).await,
                    Err(e) => warn!("Could not requeue orphan {}: {}", task_id, e),
                }
                continue;
            };

            // Locks restored for this task were taken at dispatch, so all of them belong to it
            let files: Vec<PathBuf> = task.files.iter().map(|p| self.locks.normalize(p)).collect();
            if let Err(e) = self.locks.lock_all(&agent.name, &files, "resumed task").await {
                warn!("Resumed task {} lost its files: {}", task_id, e);
                match self.scheduler.requeue(&task_id).await {
                    Ok(task) => self.persist_task(&task).await,
                    Err(e) => warn!("Could not requeue orphan {}: {}", task_id, e),
                }
                self.set_agent(state, &agent.name, AgentStatus::Idle, None).await;
                continue;
            }

            match self.backend.start(&agent, &task).await {
                Ok(handle) => {
                    self.set_agent(state, &agent.name, AgentStatus::Working, Some(task_id.clone()))
                        .await;
                    self.begin_running(state, &task, handle, files, task.restarts, None).await;
                    info!("Resumed {} on {}", task_id, agent.name);
                    self.notify(StatusEvent::task_assigned(&task_id, &agent.name));
                }
                Err(e) => {
                    self.abandon_start(state, &agent.name, &task, &files, &format!("{:#}", e))
                        .await
                }
            }
        }
    }

    /// Heartbeat from `agent` for its current task.
    ///
    /// Returns whether the report was material progress.
    pub async fn on_progress(&self, agent: &str, percent: Option<u8>, note: Option<&str>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let task_id = state
            .agents
            .get(agent)
            .ok_or_else(|| CoordinationError::not_found("agent", agent))?
            .current_task
            .clone()
            .ok_or_else(|| CoordinationError::InvalidRequest(format!("{} has no task", agent)))?;

        Ok(self.progress_locked(&mut state, &task_id, percent, note).await)
    }

    async fn progress_locked(
        &self,
        state: &mut CoordinatorState,
        task_id: &TaskId,
        percent: Option<u8>,
        note: Option<&str>,
    ) -> bool {
        let material = self.heartbeats.report(task_id, percent, note) == Some(true);
        if !material {
            return false;
        }

        let (agent, was_stuck) = match state.assignments.get_mut(task_id) {
            Some(assignment) => {
                let was_stuck = matches!(assignment.phase, Phase::Stuck { .. });
                assignment.phase = Phase::Healthy;
                (assignment.agent.clone(), was_stuck)
            }
            None => return true,
        };

        if was_stuck {
            match self.scheduler.mark_running(task_id).await {
                Ok(task) => self.persist_task(&task).await,
                Err(e) => warn!("Could not resume {}: {}", task_id, e),
            }
            self.set_agent(state, &agent, AgentStatus::Working, Some(task_id.clone()))
                .await;
            info!("{} is making progress again on {}", agent, task_id);
        }
        true
    }

    /// Check every running task against the stuck and escalation thresholds.
    ///
    /// Returns the tasks acted on.
    #[instrument(skip(self))]
    pub async fn stuck_detector(&self) -> Result<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        let mut acted = Vec::new();
        let now = Instant::now();

        for task_id in self.heartbeats.stuck_tasks() {
            let Some(assignment) = state.assignments.get(&task_id).cloned() else {
                continue;
            };

            match assignment.phase {
                Phase::Healthy => {
                    self.mark_stuck(&mut state, &task_id, &assignment).await;
                    acted.push(task_id);
                }
                Phase::Stuck { since }
                    if now.saturating_duration_since(since) >= self.config.escalation_threshold() =>
                {
                    if assignment.restarts >= self.config.max_hard_restarts {
                        if let Err(e) = self.exhaust(&mut state, &task_id, &assignment).await {
                            error!("Could not fail {} after recovery ran out: {}", task_id, e);
                            continue;
                        }
                    } else {
                        self.hard_restart(&mut state, &task_id, assignment).await;
                    }
                    acted.push(task_id);
                }
                Phase::Stuck { .. } => {}
            }
        }

        Ok(acted)
    }

    async fn mark_stuck(&self, state: &mut CoordinatorState, task_id: &TaskId, assignment: &Assignment) {
        let idle = self.heartbeats.idle_for(task_id).unwrap_or_default();
        warn!("{} on {} shows no progress for {:?}", assignment.agent, task_id, idle);

        let task = match self.scheduler.mark_stuck(task_id).await {
            Ok(task) => {
                self.persist_task(&task).await;
                task
            }
            Err(e) => {
                warn!("Could not mark {} stuck: {}", task_id, e);
                return;
            }
        };
        self.set_agent(state, &assignment.agent, AgentStatus::Stuck, Some(task_id.clone()))
            .await;

        if let Err(e) = self.backend.nudge(&assignment.handle, &task).await {
            warn!("Nudging {} failed: {:#}", task_id, e);
        }
        if let Some(a) = state.assignments.get_mut(task_id) {
            a.phase = Phase::Stuck { since: Instant::now() };
        }

        self.notify(StatusEvent::task_stuck(task_id, &assignment.agent, "nudged"));
        AuditLogger::log(
            AuditEvent::new(AuditAction::TaskNudged, &assignment.agent, format!("idle for {:?}", idle))
                .with_task(task_id),
        );
    }

    async fn hard_restart(&self, state: &mut CoordinatorState, task_id: &TaskId, assignment: Assignment) {
        let last_note = self
            .heartbeats
            .last_note(task_id)
            .or(assignment.last_note.clone());
        self.cancel_session(&assignment.handle).await;

        let task = match self.scheduler.record_restart(task_id).await {
            Ok(task) => task,
            Err(e) => {
                warn!("Could not restart {}: {}", task_id, e);
                return;
            }
        };
        let restarts = assignment.restarts + 1;
        warn!("Hard restart {}/{} of {} on {}", restarts, self.config.max_hard_restarts, task_id, assignment.agent);

        let Some(agent) = state.agents.get(&assignment.agent).cloned() else {
            return;
        };
        match self.backend.start(&agent, &task).await {
            Ok(handle) => {
                self.set_agent(state, &agent.name, AgentStatus::Working, Some(task_id.clone()))
                    .await;
                self.begin_running(state, &task, handle, assignment.files.clone(), restarts, last_note)
                    .await;
                self.notify(StatusEvent::task_stuck(
                    task_id,
                    &agent.name,
                    &format!("restarted ({} of {})", restarts, self.config.max_hard_restarts),
                ));
                AuditLogger::warn(
                    AuditEvent::new(AuditAction::TaskRestarted, &agent.name, "session restarted")
                        .with_task(task_id)
                        .with_meta("restarts", restarts),
                );
            }
            Err(e) => {
                self.abandon_start(state, &agent.name, &task, &assignment.files, &format!("{:#}", e))
                    .await
            }
        }
    }

    /// Recovery budget spent: fail the task and free everything it held
    async fn exhaust(&self, state: &mut CoordinatorState, task_id: &TaskId, assignment: &Assignment) -> Result<()> {
        let last_note = self
            .heartbeats
            .last_note(task_id)
            .or(assignment.last_note.clone())
            .unwrap_or_else(|| "no progress reported".to_string());
        let reason = CoordinationError::RecoveryExhausted {
            task: task_id.to_string(),
            attempts: assignment.restarts,
            last_note,
        }
        .to_string();

        self.cancel_session(&assignment.handle).await;
        AuditLogger::error(
            AuditEvent::new(AuditAction::RecoveryExhausted, &assignment.agent, &reason).with_task(task_id),
        );
        self.fail_with_cascade(state, task_id, &reason).await.map(|_| ())
    }

    /// Worker-reported success; dependents are dispatched right away
    #[instrument(skip(self, result))]
    pub async fn complete_task(&self, agent: &str, task: &TaskId, result: Option<String>) -> Result<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        state.check_assignment(agent, task)?;
        if let Some(assignment) = state.assignments.get(task) {
            self.cancel_session(&assignment.handle).await;
        }
        self.complete_locked(&mut state, task, result, true).await
    }

    async fn complete_locked(
        &self,
        state: &mut CoordinatorState,
        task_id: &TaskId,
        result: Option<String>,
        dispatch: bool,
    ) -> Result<Vec<TaskId>> {
        let assignment = state
            .assignments
            .remove(task_id)
            .ok_or_else(|| CoordinationError::not_found("assignment", task_id))?;
        self.heartbeats.remove(task_id);

        self.locks.release_files(&assignment.agent, Some(&assignment.files)).await;
        let newly_ready = self
            .scheduler
            .mark_completed_with(task_id, result.clone())
            .await?;
        self.set_agent(state, &assignment.agent, AgentStatus::Idle, None).await;

        self.persist_task_id(task_id).await;
        for id in &newly_ready {
            self.persist_task_id(id).await;
        }

        info!("{} completed {}", assignment.agent, task_id);
        self.notify(StatusEvent::task_completed(task_id, &assignment.agent, result.as_deref()));

        if dispatch {
            self.dispatch(state).await;
        }
        Ok(newly_ready)
    }

    /// Worker-reported failure; cascades per `cascade_failures`
    #[instrument(skip(self))]
    pub async fn fail_task(&self, agent: &str, task: &TaskId, reason: &str) -> Result<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        state.check_assignment(agent, task)?;
        if let Some(assignment) = state.assignments.get(task) {
            self.cancel_session(&assignment.handle).await;
        }
        let cascaded = self.fail_with_cascade(&mut state, task, reason).await?;
        self.dispatch(&mut state).await;
        Ok(cascaded)
    }

    async fn fail_with_cascade(
        &self,
        state: &mut CoordinatorState,
        task_id: &TaskId,
        reason: &str,
    ) -> Result<Vec<TaskId>> {
        let assignment = state
            .assignments
            .remove(task_id)
            .ok_or_else(|| CoordinationError::not_found("assignment", task_id))?;

        let reason = match self.heartbeats.remove(task_id).and_then(|r| r.last_note) {
            Some(note) if !reason.contains(&note) => format!("{} (last note: {})", reason, note),
            _ => reason.to_string(),
        };

        self.locks.release_files(&assignment.agent, Some(&assignment.files)).await;
        self.set_agent(state, &assignment.agent, AgentStatus::Idle, None).await;
        let cascaded = self
            .scheduler
            .mark_failed(task_id, self.config.cascade_failures, &reason)
            .await?;

        self.persist_task_id(task_id).await;
        for id in &cascaded {
            self.persist_task_id(id).await;
            self.notify(StatusEvent::task_failed(id, None, &format!("dependency {} failed", task_id)));
        }

        self.notify(StatusEvent::task_failed(task_id, Some(&assignment.agent), &reason));
        AuditLogger::warn(
            AuditEvent::new(AuditAction::TaskFailed, &assignment.agent, &reason)
                .with_task(task_id)
                .with_meta("cascaded", cascaded.len()),
        );
        Ok(cascaded)
    }

    /// Ask an operator for help; the agent keeps its task
    pub async fn request_help(&self, agent: &str, message: &str) -> Result<()> {
        let state = self.state.lock().await;
        let current = state
            .agents
            .get(agent)
            .ok_or_else(|| CoordinationError::not_found("agent", agent))?
            .current_task
            .clone();
        drop(state);

        info!("{} requested help: {}", agent, message);
        self.notify(StatusEvent::help_requested(agent, current.as_ref(), message));
        Ok(())
    }

    async fn require_agent(&self, name: &str) -> Result<()> {
        if self.state.lock().await.agents.contains_key(name) {
            Ok(())
        } else {
            Err(CoordinationError::not_found("agent", name))
        }
    }

    pub async fn lock_files(
        &self,
        agent: &str,
        paths: &[PathBuf],
        description: &str,
    ) -> Result<HashMap<PathBuf, LockStatus>> {
        self.require_agent(agent).await?;
        Ok(self.locks.lock_files(agent, paths, description).await)
    }

    pub async fn release_files(&self, agent: &str, paths: Option<&[PathBuf]>) -> Vec<PathBuf> {
        self.locks.release_files(agent, paths).await
    }

    pub async fn request_file(&self, requester: &str, path: &Path, reason: &str) -> Result<RequestId> {
        self.require_agent(requester).await?;
        let id = self.locks.request_file(requester, path, reason).await?;

        if let Some(request) = self.locks.get_request(id) {
            let owner = self.locks.owner_of(&request.path).unwrap_or_default();
            self.notify(StatusEvent::lock_requested(id, requester, &owner, &request.path, reason));
        }
        Ok(id)
    }

    /// Hand the file to the requester, who must still be hired
    pub async fn approve_request(&self, id: RequestId, approver: Option<&str>) -> Result<LockRequest> {
        let state = self.state.lock().await;
        let pending = self
            .locks
            .get_request(id)
            .ok_or_else(|| CoordinationError::not_found("lock_request", id))?;
        if pending.status == LockRequestStatus::Pending && !state.agents.contains_key(&pending.requester) {
            return Err(CoordinationError::not_found("agent", &pending.requester));
        }

        let previous = self.locks.owner_of(&pending.path);
        let request = self.locks.approve_request(id, approver).await?;
        drop(state);

        self.notify(StatusEvent::lock_request_resolved(&request));
        AuditLogger::log(
            AuditEvent::new(
                AuditAction::LockTransferred,
                approver.unwrap_or("admin"),
                format!("{} to {}", request.path.display(), request.requester),
            )
            .with_meta("from", previous.unwrap_or_else(|| "-".into()))
            .with_meta("request", id),
        );
        Ok(request)
    }

    pub async fn deny_request(&self, id: RequestId, approver: Option<&str>) -> Result<LockRequest> {
        let request = self.locks.deny_request(id, approver).await?;

        self.notify(StatusEvent::lock_request_resolved(&request));
        AuditLogger::log(
            AuditEvent::new(
                AuditAction::LockRequestDenied,
                approver.unwrap_or("admin"),
                format!("{} kept from {}", request.path.display(), request.requester),
            )
            .with_meta("request", id),
        );
        Ok(request)
    }

    pub fn list_locks(&self) -> Vec<FileLock> {
        self.locks.list_locks()
    }

    pub fn locks_for(&self, agent: &str) -> Vec<FileLock> {
        self.locks.locks_for(agent)
    }

    pub fn pending_requests_for(&self, owner: &str) -> Vec<LockRequest> {
        self.locks.pending_requests_for(owner)
    }

    /// Rebuild agents, locks and tasks from the state store
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<RestoreSummary> {
        let persisted = self
            .store
            .load()
            .await
            .map_err(|e| CoordinationError::Storage(format!("{:#}", e)))?;

        let mut state = self.state.lock().await;
        let mut summary = RestoreSummary {
            agents: persisted.agents.len(),
            locks: persisted.locks.len(),
            tasks: persisted.tasks.len(),
            ..Default::default()
        };

        for agent in persisted.agents {
            state.agents.insert(agent.name.clone(), agent);
        }
        self.locks.restore(persisted.locks);
        self.scheduler.restore(persisted.tasks.clone()).await;

        let mut busy: HashSet<String> = HashSet::new();
        for task in persisted.tasks.iter().filter(|t| t.status.is_in_flight()) {
            let owner = task
                .assigned_agent
                .as_ref()
                .filter(|name| {
                    state
                        .agents
                        .get(*name)
                        .map_or(false, |a| a.status != AgentStatus::Offline)
                })
                .filter(|name| !busy.contains(*name))
                .cloned();

            match owner {
                Some(name) => {
                    busy.insert(name.clone());
                    state.orphans.push(task.id.clone());
                    if let Some(agent) = state.agents.get_mut(&name) {
                        agent.status = AgentStatus::Working;
                        agent.current_task = Some(task.id.clone());
                    }
                    summary.resumed.push(task.id.clone());
                }
                None => {
                    if let Some(name) = &task.assigned_agent {
                        self.locks.release_files(name, Some(&task.files)).await;
                    }
                    match self.scheduler.requeue(&task.id).await {
                        Ok(task) => self.persist_task(&task).await,
                        Err(e) => warn!("Could not requeue {}: {}", task.id, e),
                    }
                    summary.requeued.push(task.id.clone());
                }
            }
        }

        // Agents that were mid-task but whose task is no longer in flight
        for agent in state.agents.values_mut() {
            if !busy.contains(&agent.name) && agent.status != AgentStatus::Offline {
                agent.status = AgentStatus::Idle;
                agent.current_task = None;
            }
        }

        info!(
            "Restored {} agents, {} locks, {} tasks ({} resumed, {} requeued)",
            summary.agents,
            summary.locks,
            summary.tasks,
            summary.resumed.len(),
            summary.requeued.len()
        );
        Ok(summary)
    }

    /// Spawn the tick loop and the stuck detector; both stop on `shutdown`
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let period = self.config.tick_interval();

        let ticker = {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.tick().await {
                                log_loop_error("tick", &e);
                            }
                        }
                    }
                }
                debug!("Tick loop stopped");
            })
        };

        let detector = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.stuck_detector().await {
                                log_loop_error("stuck detector", &e);
                            }
                        }
                    }
                }
                debug!("Stuck detector stopped");
            })
        };

        vec![ticker, detector]
    }

    /// Cancel every live session; task state is left for a later restore
    pub async fn shutdown(&self) {
        let state = self.state.lock().await;
        join_all(
            state
                .assignments
                .values()
                .map(|assignment| self.cancel_session(&assignment.handle)),
        )
        .await;
        info!("Coordinator stopped with {} sessions cancelled", state.assignments.len());
    }

    async fn cancel_session(&self, handle: &SessionHandle) {
        match tokio::time::timeout(self.config.cancel_grace(), self.backend.cancel(handle)).await {
            Ok(Ok(())) => debug!("Cancelled session {}", handle.id),
            Ok(Err(e)) => warn!("Cancelling session {} failed: {:#}", handle.id, e),
            Err(_) => warn!(
                "Session {} did not acknowledge cancel within {:?}",
                handle.id,
                self.config.cancel_grace()
            ),
        }
    }

    async fn set_agent(&self, state: &mut CoordinatorState, name: &str, status: AgentStatus, task: Option<TaskId>) {
        let Ok(agent) = state.agent_mut(name) else {
            return;
        };
        agent.status = status;
        agent.current_task = task;
        let agent = agent.clone();
        self.persist_agent(&agent).await;
    }

    async fn persist_agent(&self, agent: &Agent) {
        if let Err(e) = self.store.put_agent(agent).await {
            warn!("Failed to persist agent {}: {:#}", agent.name, e);
        }
    }

    async fn persist_task(&self, task: &Task) {
        if let Err(e) = self.store.put_task(task).await {
            warn!("Failed to persist task {}: {:#}", task.id, e);
        }
    }

    async fn persist_task_id(&self, id: &TaskId) {
        if let Some(task) = self.scheduler.task(id).await {
            self.persist_task(&task).await;
        }
    }

    fn notify(&self, event: StatusEvent) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&event) {
                warn!("Notifier dropped {:?}: {:#}", event.event_type, e);
            }
        }
        self.status_stream.emit(event);
    }
}

fn log_loop_error(loop_name: &str, e: &CoordinationError) {
    if e.is_critical() {
        error!("{} failed: {}", loop_name, e);
    } else {
        warn!("{} failed: {}", loop_name, e);
    }
}
