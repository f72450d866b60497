use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What happens to a fired agent's task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirePolicy {
    /// Back to `ready` for another agent, dependents untouched
    #[default]
    Requeue,
    /// Failed, dependents stay pending
    Fail,
    /// Failed together with every transitive dependent
    FailCascade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_escalation_threshold_secs")]
    pub escalation_threshold_secs: u64,
    #[serde(default = "default_max_hard_restarts")]
    pub max_hard_restarts: u32,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    #[serde(default = "default_cascade_failures")]
    pub cascade_failures: bool,
    #[serde(default)]
    pub fire_policy: FirePolicy,
    /// Every `n` lock-conflict skips add one to a ready task's priority; 0 disables
    #[serde(default)]
    pub priority_aging_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Relative lock paths are resolved against this directory
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Json,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Used when a task carries no payload
    #[serde(default)]
    pub default_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_stuck_threshold_secs() -> u64 {
    300
}

fn default_escalation_threshold_secs() -> u64 {
    120
}

fn default_max_hard_restarts() -> u32 {
    2
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_cascade_failures() -> bool {
    true
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_state_path() -> PathBuf {
    PathBuf::from("coordinator-state.json")
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            escalation_threshold_secs: default_escalation_threshold_secs(),
            max_hard_restarts: default_max_hard_restarts(),
            cancel_grace_secs: default_cancel_grace_secs(),
            cascade_failures: default_cascade_failures(),
            fire_policy: FirePolicy::default(),
            priority_aging_ticks: 0,
        }
    }
}

impl CoordinatorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn escalation_threshold(&self) -> Duration {
        Duration::from_secs(self.escalation_threshold_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_state_path(),
            postgres_url: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            default_command: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SystemConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SystemConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.coordinator;
        if c.tick_interval_secs == 0 {
            bail!("coordinator.tick_interval_secs must be greater than 0");
        }
        if c.stuck_threshold_secs == 0 {
            bail!("coordinator.stuck_threshold_secs must be greater than 0");
        }
        if c.escalation_threshold_secs == 0 {
            bail!("coordinator.escalation_threshold_secs must be greater than 0");
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.postgres_url.is_none() {
            bail!("storage.postgres_url is required for the postgres backend");
        }
        if self.worker.shell.trim().is_empty() {
            bail!("worker.shell must not be empty");
        }
        Ok(())
    }
}
