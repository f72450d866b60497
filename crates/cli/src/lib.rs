//! Command-line front end for the agent coordinator

pub mod completions;
pub mod plan;

pub use plan::{Plan, PlanAgent, PlanTask};
