use thiserror::Error;

/// Core error type for all coordination failures
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinationError {
    #[error("Conflict on {resource}: held by {owner}")]
    Conflict { resource: String, owner: String },

    #[error("Resource not found: {kind}:{id}")]
    NotFound { kind: String, id: String },

    #[error("File is not locked: {path}")]
    NotLocked { path: String },

    #[error("{agent} does not own {path}")]
    NotOwner { path: String, agent: String },

    #[error("Lock request already resolved: {request_id}")]
    AlreadyResolved { request_id: String },

    #[error("Already exists: {kind}:{id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Dependency cycle: {task} -> {dependency}")]
    CycleDetected { task: String, dependency: String },

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Recovery exhausted for task {task} after {attempts} attempts (last note: {last_note})")]
    RecoveryExhausted {
        task: String,
        attempts: u32,
        last_note: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Worker session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CoordinationError {
    pub fn conflict(resource: impl ToString, owner: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.to_string(),
            owner: owner.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    pub fn cycle(task: impl ToString, dependency: impl ToString) -> Self {
        Self::CycleDetected {
            task: task.to_string(),
            dependency: dependency.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Check if the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Timeout { .. })
    }

    /// Check if error is critical (non-recoverable)
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::CycleDetected { .. } | Self::RecoveryExhausted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
