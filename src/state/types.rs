//! State types for tracking managed resources.
//!
//! These types hold the three snapshots of every resource (desired, prior,
//! observed) together with the bookkeeping that makes reconciliation
//! resumable after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::planner::OperationKind;
use crate::remote::RequestToken;
use crate::value::Block;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept in the state document.
pub const MAX_HISTORY: usize = 50;

/// The persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Incremented on every write.
    pub serial: u64,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
    /// Resource state by name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Recent apply runs, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// State of a single resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource name from configuration.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Desired state from configuration. Absent when the resource was removed
    /// from configuration. Never persisted.
    #[serde(skip)]
    pub desired: Option<Block>,
    /// State as of the last successful reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<Block>,
    /// State last read from the remote system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Block>,
    /// External identifier, set once a create succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Resources this one referenced when it was last applied.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Position in the apply lifecycle.
    #[serde(default)]
    pub status: ApplyStatus,
    /// Mutation started but not confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingOperation>,
    /// When this entry last changed.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a resource within an apply run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// No operation has started.
    #[default]
    Pending,
    /// A remote mutation was issued and not yet confirmed.
    InProgress,
    /// The last operation succeeded.
    Applied,
    /// The last operation failed.
    Failed,
}

/// A remote mutation that was started but whose outcome is not yet recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Kind of operation.
    pub kind: OperationKind,
    /// Request token sent with every attempt.
    pub token: RequestToken,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Resources that reached Applied.
    #[serde(default)]
    pub applied: Vec<String>,
    /// Resources whose operation failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Whether the run was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

impl StateDocument {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Returns true if the document was written by a compatible version.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        major(&self.version) == major(STATE_VERSION)
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

impl ResourceState {
    /// Creates an empty entry for a resource.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            desired: None,
            prior: None,
            observed: None,
            identifier: None,
            depends_on: BTreeSet::new(),
            status: ApplyStatus::Pending,
            pending: None,
            updated_at: Utc::now(),
        }
    }

    /// The external identifier, if the resource exists remotely.
    #[must_use]
    pub fn current_identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Returns true if a previous run left a mutation unconfirmed.
    #[must_use]
    pub const fn needs_recovery(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns true if nothing is known about the resource any more.
    #[must_use]
    pub const fn is_forgotten(&self) -> bool {
        self.desired.is_none()
            && self.prior.is_none()
            && self.identifier.is_none()
            && self.pending.is_none()
    }

    /// Replaces the prior snapshot with state the remote system confirmed.
    pub fn commit(&mut self, prior: Block) {
        self.prior = Some(prior);
        self.touch();
    }

    /// Records a freshly read remote snapshot.
    pub fn observe(&mut self, observed: Block) {
        self.observed = Some(observed);
        self.touch();
    }

    /// Marks a mutation as started.
    pub fn begin(&mut self, kind: OperationKind, token: RequestToken) {
        self.status = ApplyStatus::InProgress;
        self.pending = Some(PendingOperation {
            kind,
            token,
            started_at: Utc::now(),
        });
        self.touch();
    }

    /// Records a successful create.
    pub fn record_created(&mut self, identifier: String, observed: Block) {
        self.identifier = Some(identifier);
        self.record_applied(observed);
    }

    /// Records a successful update or an in-place confirmation.
    pub fn record_applied(&mut self, observed: Block) {
        self.observed = Some(observed.clone());
        self.commit(observed);
        self.depends_on = self
            .desired
            .as_ref()
            .map(crate::value::block_references)
            .unwrap_or_default();
        self.status = ApplyStatus::Applied;
        self.pending = None;
    }

    /// Records a successful delete.
    pub fn record_destroyed(&mut self) {
        self.clear_remote();
        self.status = ApplyStatus::Applied;
        self.pending = None;
    }

    /// Forgets the remote object after the remote system reported it missing.
    pub fn clear_remote(&mut self) {
        self.identifier = None;
        self.prior = None;
        self.observed = None;
        self.depends_on.clear();
        self.touch();
    }

    /// Records a failed operation.
    ///
    /// The pending marker is kept so the next run checks what the remote
    /// system actually did before acting again.
    pub fn record_failed(&mut self) {
        self.status = ApplyStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a history entry for a finished run.
    #[must_use]
    pub fn new(applied: Vec<String>, failed: Vec<String>, cancelled: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            applied,
            failed,
            cancelled,
        }
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

impl std::fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        write!(f, "{status}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{reference_to, Value};

    fn block(size: &str) -> Block {
        [(String::from("vm_size"), Value::string(size))].into()
    }

    #[test]
    fn test_lifecycle() {
        let mut state = ResourceState::new("vm1", "virtual_machine");
        assert_eq!(state.status, ApplyStatus::Pending);
        assert!(state.current_identifier().is_none());

        state.desired = Some(
            [(
                String::from("network_interface_ids"),
                Value::set([Value::string(reference_to("nic1"))]),
            )]
            .into(),
        );
        state.begin(OperationKind::Create, RequestToken::from_string("t-1"));
        assert_eq!(state.status, ApplyStatus::InProgress);
        assert!(state.needs_recovery());

        state.record_created(String::from("/vms/vm1"), block("Standard_A1"));
        assert_eq!(state.current_identifier(), Some("/vms/vm1"));
        assert_eq!(state.prior, Some(block("Standard_A1")));
        assert_eq!(state.observed, state.prior);
        assert_eq!(state.status, ApplyStatus::Applied);
        assert!(!state.needs_recovery());
        assert!(state.depends_on.contains("nic1"));

        state.record_destroyed();
        assert!(state.current_identifier().is_none());
        assert!(state.prior.is_none());
        assert!(state.observed.is_none());
    }

    #[test]
    fn test_failure_keeps_pending_marker() {
        let mut state = ResourceState::new("vm1", "virtual_machine");
        state.begin(OperationKind::Create, RequestToken::from_string("t-1"));
        state.record_failed();
        assert_eq!(state.status, ApplyStatus::Failed);
        assert_eq!(
            state.pending.as_ref().map(|p| p.token.as_str()),
            Some("t-1")
        );
    }

    #[test]
    fn test_desired_is_not_persisted() {
        let mut state = ResourceState::new("vm1", "virtual_machine");
        state.desired = Some(block("Standard_A2"));
        state.commit(block("Standard_A1"));

        let json = serde_json::to_string(&state).unwrap();
        let restored: ResourceState = serde_json::from_str(&json).unwrap();
        assert!(restored.desired.is_none());
        assert_eq!(restored.prior, Some(block("Standard_A1")));
    }

    #[test]
    fn test_version_compatibility() {
        let mut doc = StateDocument::new();
        assert!(doc.is_compatible());
        doc.version = String::from("1.4");
        assert!(doc.is_compatible());
        doc.version = String::from("2.0");
        assert!(!doc.is_compatible());
    }
}
