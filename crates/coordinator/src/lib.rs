//! Agent coordinator: file ownership, dependency scheduling and worker supervision
//!
//! This crate provides the concurrency-coordination core with:
//! - Atomic multi-resource acquisition with FIFO blocking waits
//! - Per-file locks with request / approve / deny transfer
//! - A dependency DAG scheduler with cycle rejection and priority aging
//! - Heartbeat-based stuck detection with bounded recovery
//! - Pluggable worker backends and notification sinks

pub mod audit;
pub mod coordinator;
pub mod filelocks;
pub mod heartbeat;
pub mod resource_pool;
pub mod scheduler;
pub mod session;
pub mod status_stream;
pub mod tracing_setup;

// Re-exports
pub use coordinator::{AgentCoordinator, RestoreSummary, TickSummary};
pub use filelocks::FileLockManager;
pub use heartbeat::{HeartbeatMonitor, HeartbeatRecord};
pub use resource_pool::ResourcePool;
pub use scheduler::{DependencyGraph, PriorityOrder, TaskScheduler};
pub use session::{CommandBackend, SessionHandle, SessionId, SessionPoll, WorkerBackend};
pub use status_stream::{Notifier, StatusEvent, StatusEventType, StatusStream};
