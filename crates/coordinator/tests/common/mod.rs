//! Shared fixtures for coordinator integration tests
#![allow(dead_code)]

use ai_agent_common::{Agent, MemoryStore, SystemConfig, Task, TaskId};
use ai_agent_coordinator::{AgentCoordinator, SessionHandle, SessionPoll, WorkerBackend};
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Worker backend driven entirely by the test
#[derive(Default)]
pub struct ScriptedBackend {
    polls: Mutex<HashMap<TaskId, SessionPoll>>,
    pub started: Mutex<Vec<(String, TaskId)>>,
    pub cancelled: Mutex<Vec<TaskId>>,
    pub nudged: Mutex<Vec<TaskId>>,
    refuse_start: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// What every later poll of `task` returns
    pub fn set_poll(&self, task: &str, poll: SessionPoll) {
        self.polls.lock().insert(TaskId::from(task), poll);
    }

    pub fn refuse_starts(&self, refuse: bool) {
        self.refuse_start.store(refuse, Ordering::SeqCst);
    }

    pub fn starts_of(&self, task: &str) -> usize {
        self.started
            .lock()
            .iter()
            .filter(|(_, t)| t.as_str() == task)
            .count()
    }

    pub fn cancels_of(&self, task: &str) -> usize {
        self.cancelled
            .lock()
            .iter()
            .filter(|t| t.as_str() == task)
            .count()
    }
}

#[async_trait]
impl WorkerBackend for ScriptedBackend {
    async fn start(&self, agent: &Agent, task: &Task) -> anyhow::Result<SessionHandle> {
        if self.refuse_start.load(Ordering::SeqCst) {
            bail!("no worker slots left");
        }
        self.started
            .lock()
            .push((agent.name.clone(), task.id.clone()));
        Ok(SessionHandle::new(&agent.name, task.id.clone()))
    }

    async fn cancel(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        self.cancelled.lock().push(handle.task.clone());
        Ok(())
    }

    async fn poll(&self, handle: &SessionHandle) -> anyhow::Result<SessionPoll> {
        Ok(self
            .polls
            .lock()
            .get(&handle.task)
            .cloned()
            .unwrap_or_default())
    }

    async fn nudge(&self, handle: &SessionHandle, _task: &Task) -> anyhow::Result<()> {
        self.nudged.lock().push(handle.task.clone());
        Ok(())
    }
}

/// Short thresholds so paused-clock tests stay readable
pub fn config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.coordinator.tick_interval_secs = 1;
    config.coordinator.stuck_threshold_secs = 60;
    config.coordinator.escalation_threshold_secs = 30;
    config.coordinator.cancel_grace_secs = 1;
    config.locks.workspace_root = Some(PathBuf::from("/repo"));
    config
}

pub fn build(backend: Arc<ScriptedBackend>, config: SystemConfig) -> (Arc<AgentCoordinator>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = build_with_store(backend, config, store.clone());
    (coordinator, store)
}

pub fn build_with_store(
    backend: Arc<ScriptedBackend>,
    config: SystemConfig,
    store: Arc<MemoryStore>,
) -> Arc<AgentCoordinator> {
    Arc::new(AgentCoordinator::new(&config, backend, store))
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

pub fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}
