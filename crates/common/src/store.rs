//! Durable state contract
//!
//! Three tables are enough to rebuild lock ownership and task status after a
//! restart: agents, file locks and tasks. Backends live in `ai-agent-storage`;
//! [`MemoryStore`] is the in-process fake used by tests and the `memory`
//! storage backend.

use crate::types::{Agent, FileLock, Task, TaskId};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Snapshot of everything a store holds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub locks: Vec<FileLock>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;

    async fn put_agent(&self, agent: &Agent) -> Result<()>;

    async fn delete_agent(&self, name: &str) -> Result<()>;

    async fn put_lock(&self, lock: &FileLock) -> Result<()>;

    async fn delete_lock(&self, path: &Path) -> Result<()>;

    async fn put_task(&self, task: &Task) -> Result<()>;
}

/// Keyed tables shared by the in-memory and JSON backends
#[derive(Debug, Clone, Default)]
pub struct StateTables {
    pub agents: BTreeMap<String, Agent>,
    pub locks: BTreeMap<PathBuf, FileLock>,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl StateTables {
    pub fn from_state(state: PersistedState) -> Self {
        Self {
            agents: state.agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
            locks: state.locks.into_iter().map(|l| (l.path.clone(), l)).collect(),
            tasks: state.tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    pub fn to_state(&self) -> PersistedState {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        PersistedState {
            agents: self.agents.values().cloned().collect(),
            locks: self.locks.values().cloned().collect(),
            tasks,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<StateTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            tables: RwLock::new(StateTables::from_state(state)),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<PersistedState> {
        Ok(self.tables.read().await.to_state())
    }

    async fn put_agent(&self, agent: &Agent) -> Result<()> {
        self.tables
            .write()
            .await
            .agents
            .insert(agent.name.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, name: &str) -> Result<()> {
        self.tables.write().await.agents.remove(name);
        Ok(())
    }

    async fn put_lock(&self, lock: &FileLock) -> Result<()> {
        self.tables
            .write()
            .await
            .locks
            .insert(lock.path.clone(), lock.clone());
        Ok(())
    }

    async fn delete_lock(&self, path: &Path) -> Result<()> {
        self.tables.write().await.locks.remove(path);
        Ok(())
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        self.tables
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }
}
