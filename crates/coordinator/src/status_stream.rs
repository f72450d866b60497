//! Coordinator notifications
//!
//! Events are fire-and-forget. A [`Notifier`] that fails is logged by the
//! caller and never rolls back coordinator state.

use ai_agent_common::{LockRequest, RequestId, TaskId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_type: StatusEventType,
    pub agent_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventType {
    TaskAssigned,
    TaskStuck,
    TaskCompleted,
    TaskFailed,
    HelpRequested,
    LockRequested,
    LockRequestResolved,
    AgentHired,
    AgentFired,
}

impl StatusEvent {
    pub fn new(event_type: StatusEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            agent_id: None,
            task_id: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_id = Some(agent.into());
        self
    }

    pub fn with_task(mut self, task: &TaskId) -> Self {
        self.task_id = Some(task.clone());
        self
    }

    pub fn task_assigned(task: &TaskId, agent: &str) -> Self {
        Self::new(StatusEventType::TaskAssigned, format!("{} assigned to {}", task, agent))
            .with_agent(agent)
            .with_task(task)
    }

    pub fn task_stuck(task: &TaskId, agent: &str, action: &str) -> Self {
        Self::new(StatusEventType::TaskStuck, format!("{} is stuck on {}: {}", agent, task, action))
            .with_agent(agent)
            .with_task(task)
    }

    pub fn task_completed(task: &TaskId, agent: &str, result: Option<&str>) -> Self {
        let message = match result {
            Some(result) => format!("{} completed by {}: {}", task, agent, result),
            None => format!("{} completed by {}", task, agent),
        };
        Self::new(StatusEventType::TaskCompleted, message)
            .with_agent(agent)
            .with_task(task)
    }

    pub fn task_failed(task: &TaskId, agent: Option<&str>, reason: &str) -> Self {
        let event = Self::new(StatusEventType::TaskFailed, format!("{} failed: {}", task, reason))
            .with_task(task);
        match agent {
            Some(agent) => event.with_agent(agent),
            None => event,
        }
    }

    pub fn help_requested(agent: &str, task: Option<&TaskId>, message: &str) -> Self {
        let event = Self::new(StatusEventType::HelpRequested, message).with_agent(agent);
        match task {
            Some(task) => event.with_task(task),
            None => event,
        }
    }

    pub fn lock_requested(id: RequestId, requester: &str, owner: &str, path: &Path, reason: &str) -> Self {
        Self::new(
            StatusEventType::LockRequested,
            format!("{} asks {} for {} ({}) [{}]", requester, owner, path.display(), reason, id),
        )
        .with_agent(owner)
    }

    pub fn lock_request_resolved(request: &LockRequest) -> Self {
        Self::new(
            StatusEventType::LockRequestResolved,
            format!(
                "Request {} by {} for {} {}",
                request.id,
                request.requester,
                request.path.display(),
                request.status
            ),
        )
        .with_agent(&request.requester)
    }

    pub fn agent_hired(agent: &str, role: &str) -> Self {
        Self::new(StatusEventType::AgentHired, format!("{} hired as {}", agent, role))
            .with_agent(agent)
    }

    pub fn agent_fired(agent: &str, task: Option<&TaskId>) -> Self {
        let event = Self::new(StatusEventType::AgentFired, format!("{} fired", agent)).with_agent(agent);
        match task {
            Some(task) => event.with_task(task),
            None => event,
        }
    }
}

/// Receiver of coordinator events; must not block
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &StatusEvent) -> Result<()>;
}

pub struct StatusStream {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusStream {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self { sender }
    }

    /// Emit status event
    pub fn emit(&self, event: StatusEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to status events
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for StatusStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for StatusStream {
    fn notify(&self, event: &StatusEvent) -> Result<()> {
        self.emit(event.clone());
        Ok(())
    }
}
