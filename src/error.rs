//! Error types for the reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration loading, state persistence, remote calls, planning, and
//! plan execution.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::reconciler::ApplyReport;

/// The main error type for the engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Errors reported by the remote system.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Plan execution errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Desired state has the wrong shape.
    #[error(
        "Invalid {}{}: {message}",
        .resource.as_deref().unwrap_or("configuration"),
        .field.as_deref().map(|f| format!(" field '{f}'")).unwrap_or_default()
    )]
    ValidationError {
        /// Resource the value belongs to.
        resource: Option<String>,
        /// Field that failed validation.
        field: Option<String>,
        /// Description of the problem.
        message: String,
    },

    /// A required field is absent from desired state.
    #[error("Resource '{resource}' is missing required field '{field}'")]
    MissingRequiredField {
        /// Resource name.
        resource: String,
        /// Path of the missing field.
        field: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A resource uses a type with no registered schema.
    #[error("Resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType {
        /// Resource name.
        resource: String,
        /// The unregistered type.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by {holder} for {purpose} since {since}")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// What the holder is doing.
        purpose: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No state is recorded for the resource.
    #[error("Unknown resource: {name}")]
    UnknownResource {
        /// Resource name.
        name: String,
    },

    /// The resource is owned by a running operation.
    #[error("Resource '{name}' is checked out by a running operation")]
    CheckedOut {
        /// Resource name.
        name: String,
    },
}

/// Errors returned by a [`RemoteOps`](crate::remote::RemoteOps) implementation.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Network failure, timeout or throttling. Safe to retry.
    #[error("transient remote failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
        /// Delay requested by the remote system, if any.
        retry_after: Option<Duration>,
    },

    /// The remote object does not exist.
    #[error("remote object not found: {identifier}")]
    NotFound {
        /// Identifier that was looked up.
        identifier: String,
    },

    /// A failure that retrying cannot fix.
    #[error("{kind}: {message}")]
    Terminal {
        /// Category of the failure.
        kind: TerminalKind,
        /// Description of the failure.
        message: String,
    },
}

/// Categories of terminal remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Credentials were rejected or lack permission.
    Authorization,
    /// A quota or capacity limit was hit.
    Quota,
    /// The object to update no longer exists.
    NotFoundOnUpdate,
    /// The request was rejected as invalid.
    Rejected,
}

/// Planning errors. Any of these aborts planning; no partial plan is run.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A required field present in prior state is absent from desired state.
    #[error("Resource '{resource}' is missing required field '{field}'")]
    MissingRequiredField {
        /// Resource name.
        resource: String,
        /// Path of the missing field.
        field: String,
    },

    /// Resources reference each other in a loop.
    #[error("Cyclic dependency: {cycle}")]
    CyclicDependency {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },

    /// A reference points at a resource that will not exist.
    #[error("Resource '{resource}' references '{target}', which is not declared")]
    DanglingReference {
        /// Referencing resource.
        resource: String,
        /// Referenced resource.
        target: String,
    },

    /// A resource uses a type with no registered schema.
    #[error("Resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType {
        /// Resource name.
        resource: String,
        /// The unregistered type.
        resource_type: String,
    },

    /// Conflicting operations in plan.
    #[error("Conflicting operations in plan: {message}")]
    ConflictingOperations {
        /// Description of the conflict.
        message: String,
    },
}

/// Plan execution errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Some operations succeeded and others did not.
    #[error("Partial apply: {}", .report.summary())]
    PartialApply {
        /// Full outcome of the run, both applied and failed sets.
        report: Box<ApplyReport>,
    },

    /// A single operation failed.
    #[error("Failed to {operation} '{resource}': {source}")]
    OperationFailed {
        /// Resource name.
        resource: String,
        /// Operation that failed.
        operation: String,
        /// Underlying remote error.
        source: RemoteError,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}: {last}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
        /// Last error seen.
        last: RemoteError,
    },

    /// A reference could not be resolved at execution time.
    #[error("Resource '{resource}' still references '{target}' after its dependencies applied")]
    UnresolvedReference {
        /// Referencing resource.
        resource: String,
        /// Referenced resource.
        target: String,
    },

    /// Execution was cancelled by the caller.
    #[error("Reconciliation cancelled: {reason}")]
    Cancelled {
        /// Reason for the cancellation.
        reason: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Remote(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl RemoteError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a terminal error.
    #[must_use]
    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            identifier: identifier.into(),
        }
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the remote object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the delay requested by the remote system, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Authorization => "authorization failed",
            Self::Quota => "quota exceeded",
            Self::NotFoundOnUpdate => "object vanished before update",
            Self::Rejected => "request rejected",
        };
        write!(f, "{s}")
    }
}

impl ConfigError {
    /// Creates a validation error for a specific resource field.
    #[must_use]
    pub fn validation(
        resource: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ValidationError {
            resource: Some(resource.into()),
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Creates a validation error without a specific resource or field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            resource: None,
            field: None,
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
