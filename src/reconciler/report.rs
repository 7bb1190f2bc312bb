//! Outcome reports for apply and refresh.

use serde::Serialize;

use crate::error::{ReconcileError, Result};
use crate::planner::OperationKind;

/// Outcome of one apply run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Resources whose operation succeeded.
    pub applied: Vec<String>,
    /// Resources that needed no change.
    pub unchanged: Vec<String>,
    /// Operations that failed.
    pub failed: Vec<FailedOperation>,
    /// Operations not attempted because a dependency failed.
    pub skipped: Vec<SkippedOperation>,
    /// Operations not started because the run was cancelled.
    pub not_started: Vec<String>,
    /// Operations that were running when cancellation was requested.
    pub in_flight_at_cancel: Vec<String>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// An operation that failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedOperation {
    /// Resource name.
    pub resource: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Error message.
    pub error: String,
}

/// An operation skipped because something it depends on did not apply.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedOperation {
    /// Resource name.
    pub resource: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// The dependency that failed or was itself skipped.
    pub blocked_by: String,
}

/// Differences between recorded and actual remote state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Resources whose remote state differs from prior state.
    pub resources: Vec<ResourceDrift>,
    /// Resources that could not be read.
    pub errors: Vec<ReadFailure>,
}

/// A resource whose remote state could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct ReadFailure {
    /// Resource name.
    pub resource: String,
    /// Error message.
    pub error: String,
}

/// Drift of a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDrift {
    /// Resource name.
    pub resource: String,
    /// Top-level fields whose remote value differs.
    pub drifted: Vec<String>,
    /// The remote object no longer exists.
    pub vanished: bool,
}

impl ApplyReport {
    /// Returns true if every planned operation succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
            && self.skipped.is_empty()
            && self.not_started.is_empty()
            && !self.cancelled
    }

    /// One-line summary of the run.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} applied, {} unchanged, {} failed, {} skipped",
            self.applied.len(),
            self.unchanged.len(),
            self.failed.len(),
            self.skipped.len()
        );
        if self.cancelled {
            summary.push_str(&format!(
                ", cancelled with {} not started",
                self.not_started.len()
            ));
        }
        summary
    }

    /// Turns an incomplete run into an error carrying the report.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::PartialApply`] unless every operation
    /// succeeded.
    pub fn ensure_complete(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(ReconcileError::PartialApply {
                report: Box::new(self),
            }
            .into())
        }
    }
}

impl DriftReport {
    /// Returns true if nothing drifted and every read succeeded.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.resources.is_empty() && self.errors.is_empty()
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Apply: {}", self.summary())?;
        for resource in &self.applied {
            writeln!(f, "  + {resource}")?;
        }
        for failed in &self.failed {
            writeln!(f, "  ! {} {}: {}", failed.kind, failed.resource, failed.error)?;
        }
        for skipped in &self.skipped {
            writeln!(
                f,
                "  - {} {} (blocked by {})",
                skipped.kind, skipped.resource, skipped.blocked_by
            )?;
        }
        for resource in &self.in_flight_at_cancel {
            writeln!(f, "  ? {resource} (in flight at cancel)")?;
        }
        for resource in &self.not_started {
            writeln!(f, "  - {resource} (not started)")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for drift in &self.resources {
            if drift.vanished {
                writeln!(f, "  {}: no longer exists", drift.resource)?;
            } else {
                writeln!(f, "  {}: {}", drift.resource, drift.drifted.join(", "))?;
            }
        }
        for error in &self.errors {
            writeln!(f, "  {}: read failed: {}", error.resource, error.error)?;
        }
        Ok(())
    }
}
