//! Common types and utilities shared across all crates

pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::*;
pub use error::CoordinationError;
pub use store::{MemoryStore, PersistedState, StateStore, StateTables};
pub use types::*;
