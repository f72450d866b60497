//! Single-file JSON state store
//!
//! Every mutation rewrites the whole snapshot to a sibling temp file and
//! renames it over the target, so a crash leaves either the old or the new
//! state on disk.

use ai_agent_common::{Agent, FileLock, PersistedState, StateStore, StateTables, Task};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct JsonFileStore {
    path: PathBuf,
    tables: Mutex<StateTables>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => PersistedState::default(),
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt state file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", path.display());
                PersistedState::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        Ok(Self {
            path,
            tables: Mutex::new(StateTables::from_state(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, tables: &StateTables) -> Result<()> {
        let body = serde_json::to_vec_pretty(&tables.to_state())
            .context("Failed to serialize coordinator state")?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Wrote {} bytes to {}", body.len(), self.path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<PersistedState> {
        Ok(self.tables.lock().await.to_state())
    }

    async fn put_agent(&self, agent: &Agent) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.agents.insert(agent.name.clone(), agent.clone());
        self.flush(&tables).await
    }

    async fn delete_agent(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.agents.remove(name).is_none() {
            return Ok(());
        }
        self.flush(&tables).await
    }

    async fn put_lock(&self, lock: &FileLock) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.locks.insert(lock.path.clone(), lock.clone());
        self.flush(&tables).await
    }

    async fn delete_lock(&self, path: &Path) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.locks.remove(path).is_none() {
            return Ok(());
        }
        self.flush(&tables).await
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        let mut tables = self.tables.lock().await;
        tables.tasks.insert(task.id.clone(), task.clone());
        self.flush(&tables).await
    }
}
