use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Unique identifier for tasks.
///
/// Callers may pick their own ids (`"build-api"`), otherwise one is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier for lock requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Stuck,
    Offline,
}

/// A named worker identity that owns files and executes tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: Option<TaskId>,
    pub hired_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            status: AgentStatus::Idle,
            current_task: None,
            hired_at: Utc::now(),
        }
    }

    /// Whether this agent may be handed a task requiring `role`.
    pub fn can_take(&self, role: Option<&str>) -> bool {
        role.map_or(true, |r| r == self.role)
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Stuck,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Assigned to an agent and not finished yet.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::Running | TaskStatus::Stuck
        )
    }
}

/// A unit of work with dependencies, priority and lifecycle status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Only agents with this role receive the task
    #[serde(default)]
    pub role: Option<String>,
    /// Opaque payload interpreted by the worker backend
    #[serde(default)]
    pub payload: Option<String>,
    /// Submission order, used as the FIFO tie-break
    pub seq: u64,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub skipped: u32,
}

impl Task {
    pub fn from_new(task: NewTask, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: task.id.unwrap_or_else(TaskId::generate),
            description: task.description,
            depends_on: task.depends_on,
            priority: task.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            files: task.files,
            role: task.role,
            payload: task.payload,
            seq,
            submitted_at: now,
            updated_at: now,
            failure: None,
            result: None,
            restarts: 0,
            skipped: 0,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Submission form of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// Exclusive ownership record binding one file path to one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub path: PathBuf,
    pub owner: String,
    pub description: String,
    pub acquired_at: DateTime<Utc>,
}

impl FileLock {
    pub fn new(path: PathBuf, owner: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            path,
            owner: owner.into(),
            description: description.into(),
            acquired_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockRequestStatus {
    Pending,
    Approved,
    Denied,
    /// The requester left before anyone answered
    Withdrawn,
}

/// A pending ask to transfer ownership of a locked file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub id: RequestId,
    pub requester: String,
    pub path: PathBuf,
    pub reason: String,
    pub status: LockRequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Per-path outcome of a bulk lock call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// Newly locked for the caller
    Locked,
    /// The caller already owned it
    AlreadyOwned,
    /// Owned by someone else
    AlreadyLocked(String),
}

impl LockStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, LockStatus::Locked | LockStatus::AlreadyOwned)
    }
}
