//! Structured audit log
//!
//! Ownership transfers, firings and terminal failures are written on the
//! `audit` target so they can be routed separately from operational logs.

use ai_agent_common::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;
use tracing::{error, info, span, warn, Level};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    AgentHired,
    AgentFired,
    LockTransferred,
    LockRequestDenied,
    TaskNudged,
    TaskRestarted,
    TaskFailed,
    RecoveryExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent_id: String,
    pub task_id: Option<TaskId>,
    pub action: AuditAction,
    pub detail: String,
    pub metadata: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, agent: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            agent_id: agent.into(),
            task_id: None,
            action,
            detail: detail.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_task(mut self, task: &TaskId) -> Self {
        self.task_id = Some(task.clone());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    fn task_label(&self) -> &str {
        self.task_id.as_ref().map_or("-", |t| t.as_str())
    }
}

#[derive(Debug)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn log(event: AuditEvent) {
        let span = span!(
            Level::INFO,
            "audit.event",
            event_id = %event.event_id,
            task_id = %event.task_label(),
            agent_id = %event.agent_id,
            action = %event.action,
        );
        let _enter = span.enter();

        info!(target: "audit", "{}: {} {:?}", event.action, event.detail, event.metadata);
    }

    pub fn warn(event: AuditEvent) {
        let span = span!(
            Level::WARN,
            "audit.warning",
            event_id = %event.event_id,
            task_id = %event.task_label(),
        );
        let _enter = span.enter();

        warn!(target: "audit", "{} by {}: {} {:?}", event.action, event.agent_id, event.detail, event.metadata);
    }

    pub fn error(event: AuditEvent) {
        let span = span!(
            Level::ERROR,
            "audit.error",
            event_id = %event.event_id,
            task_id = %event.task_label(),
        );
        let _enter = span.enter();

        error!(target: "audit", "{} by {}: {} {:?}", event.action, event.agent_id, event.detail, event.metadata);
    }
}
