//! Plan types.
//!
//! A [`Plan`] is an immutable, ordered list of operations. Every operation's
//! dependencies appear before it, so executing in order is always valid;
//! the dependency indices let independent operations run concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::PlanError;
use crate::schema::ResourceSchema;

use super::diff::Delta;

/// Kind of operation planned for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Nothing to do.
    NoOp,
    /// Create a resource that does not exist.
    Create,
    /// Change a resource in place.
    Update,
    /// Destroy the existing resource, then create it again.
    Replace,
    /// Destroy a resource that left configuration.
    Destroy,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    /// Kind of operation.
    pub kind: OperationKind,
    /// Resource name.
    pub resource: String,
    /// Resource type.
    pub resource_type: String,
    /// External identifier of the existing resource, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Changes that justify the operation.
    pub delta: Delta,
    /// Indices of operations that must be applied first.
    pub depends_on: Vec<usize>,
    /// Human-readable reason.
    pub reason: String,
    /// Schema of the resource type, for re-diffing once references resolve.
    #[serde(skip)]
    pub schema: Arc<ResourceSchema>,
}

/// An ordered, immutable execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    created_at: DateTime<Utc>,
    operations: Vec<Operation>,
}

impl OperationKind {
    /// Returns true if the operation calls the remote system.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Returns true if the operation gives the resource a new identifier.
    #[must_use]
    pub const fn creates(self) -> bool {
        matches!(self, Self::Create | Self::Replace)
    }
}

impl Plan {
    /// Builds a plan from operations already in dependency order.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ConflictingOperations`] if a resource has more
    /// than one operation or an operation depends on a later one.
    pub fn new(operations: Vec<Operation>) -> Result<Self, PlanError> {
        let mut seen = HashSet::new();
        for (index, operation) in operations.iter().enumerate() {
            if !seen.insert(operation.resource.as_str()) {
                return Err(PlanError::ConflictingOperations {
                    message: format!("resource '{}' has more than one operation", operation.resource),
                });
            }
            if let Some(dep) = operation.depends_on.iter().find(|d| **d >= index) {
                return Err(PlanError::ConflictingOperations {
                    message: format!(
                        "operation {index} on '{}' depends on later operation {dep}",
                        operation.resource
                    ),
                });
            }
        }
        Ok(Self {
            created_at: Utc::now(),
            operations,
        })
    }

    /// When the plan was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// All operations in execution order, including no-ops.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operation at an index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    /// Operation planned for a resource.
    #[must_use]
    pub fn operation_for(&self, resource: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.resource == resource)
    }

    /// Operations that call the remote system.
    pub fn changes(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| op.kind.is_change())
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes().next().is_none()
    }

    /// Number of operations, including no-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Number of operations of a kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    /// Indices of operations that depend on `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.depends_on.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }
}

impl Operation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::NoOp => format!("No change for '{}'", self.resource),
            OperationKind::Create => format!("Create {} '{}'", self.resource_type, self.resource),
            OperationKind::Update => format!("Update {} '{}' in place", self.resource_type, self.resource),
            OperationKind::Replace => format!("Replace {} '{}'", self.resource_type, self.resource),
            OperationKind::Destroy => format!("Destroy {} '{}'", self.resource_type, self.resource),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoOp => "noop",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        let changes: Vec<_> = self.changes().collect();
        writeln!(f, "Plan ({} operations):", changes.len())?;
        for (i, operation) in changes.iter().enumerate() {
            writeln!(f, "  {i}. {operation}")?;
        }
        Ok(())
    }
}
