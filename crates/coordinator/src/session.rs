//! Worker session contract
//!
//! The coordinator never runs task payloads itself. It hands a task to a
//! [`WorkerBackend`] and afterwards only sees the opaque [`SessionHandle`] plus
//! whatever [`SessionPoll`] reports.

pub mod command;

pub use command::CommandBackend;

use ai_agent_common::{Agent, Task, TaskId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordinator-side view of one running worker execution
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub agent: String,
    pub task: TaskId,
    pub started_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(agent: impl Into<String>, task: TaskId) -> Self {
        Self {
            id: SessionId::new(),
            agent: agent.into(),
            task,
            started_at: Utc::now(),
        }
    }
}

/// Snapshot returned by [`WorkerBackend::poll`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPoll {
    /// Latest reported percent complete
    pub progress: Option<u8>,
    pub note: Option<String>,
    pub done: bool,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl SessionPoll {
    pub fn running(progress: Option<u8>, note: Option<&str>) -> Self {
        Self {
            progress,
            note: note.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn finished(result: Option<String>) -> Self {
        Self {
            progress: Some(100),
            done: true,
            result,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Execution backend the coordinator dispatches tasks to
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Start executing `task` on behalf of `agent`
    async fn start(&self, agent: &Agent, task: &Task) -> Result<SessionHandle>;

    /// Best-effort cooperative stop
    async fn cancel(&self, handle: &SessionHandle) -> Result<()>;

    async fn poll(&self, handle: &SessionHandle) -> Result<SessionPoll>;

    /// Re-send the task context to a worker that stopped reporting progress
    async fn nudge(&self, _handle: &SessionHandle, _task: &Task) -> Result<()> {
        Ok(())
    }
}
