//! Planning.
//!
//! This module turns desired and prior-applied state into an execution plan:
//! - [`Differ`] computes field-level deltas annotated with mutability
//! - [`Planner`] decides the operation for each resource and orders them
//! - [`DependencyGraph`] orders resources by their references

mod diff;
mod engine;
mod graph;
mod plan;

pub use diff::{member_identity, Delta, DiffResult, Differ, FieldChange};
pub use engine::Planner;
pub use graph::DependencyGraph;
pub use plan::{Operation, OperationKind, Plan};
