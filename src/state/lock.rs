//! State locking.
//!
//! A lock guards the state document while a run mutates it, so two runs
//! never reconcile the same resources at once. Locks expire so that a
//! crashed run cannot block every later one; `converge state unlock`
//! releases a lock early.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 900;

/// What a run holds the state lock for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    /// Reading remote state into the store.
    Refresh,
    /// Executing a plan.
    Apply,
    /// Refresh, plan and apply in one run.
    Converge,
    /// Editing state by hand.
    StateEdit,
}

/// Information about a held state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier, the handle for `converge state unlock`.
    pub lock_id: String,
    /// Host and process holding the lock.
    pub holder: String,
    /// What the holder is doing.
    pub purpose: LockPurpose,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock stops being honoured.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock for the current process.
    #[must_use]
    pub fn for_current_process(purpose: LockPurpose) -> Self {
        Self::new(generate_holder_id(), purpose)
    }

    /// Creates a lock for a named holder.
    #[must_use]
    pub fn new(holder: impl Into<String>, purpose: LockPurpose) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.into(),
            purpose,
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Checks that a lock can be taken over the one currently recorded.
///
/// Expired locks are taken over with a warning.
///
/// # Errors
///
/// Returns [`StateError::LockedByOther`] if `existing` is still live.
pub fn ensure_free(existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(ConvergeError::State(StateError::LockedByOther {
            holder: lock.holder.clone(),
            purpose: lock.purpose.to_string(),
            since: lock.acquired_at.to_rfc3339(),
        })),
        Some(lock) => {
            warn!(
                "Taking over expired {} lock {} held by {}",
                lock.purpose, lock.lock_id, lock.holder
            );
            Ok(())
        }
        None => Ok(()),
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );
    let run = Uuid::new_v4().simple().to_string();
    format!("{hostname}:{}:{}", std::process::id(), &run[..8])
}

impl std::fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let purpose = match self {
            Self::Refresh => "refresh",
            Self::Apply => "apply",
            Self::Converge => "converge",
            Self::StateEdit => "state edit",
        };
        write!(f, "{purpose}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner", LockPurpose::Apply);
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_live_lock_blocks() {
        let lock = LockInfo::new("ci-runner", LockPurpose::Converge);
        let err = ensure_free(Some(&lock)).unwrap_err();
        assert!(err.to_string().contains("ci-runner"), "{err}");
        assert!(err.to_string().contains("converge"), "{err}");
        assert!(ensure_free(None).is_ok());
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let mut lock = LockInfo::new("crashed", LockPurpose::Apply);
        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
        assert!(ensure_free(Some(&lock)).is_ok());
    }

    #[test]
    fn test_holder_id_names_process() {
        let id = generate_holder_id();
        assert_ne!(id, generate_holder_id());
        assert!(id.contains(&format!(":{}:", std::process::id())));
    }

    #[test]
    fn test_purpose_serializes_snake_case() {
        let json = serde_json::to_string(&LockPurpose::StateEdit).unwrap();
        assert_eq!(json, "\"state_edit\"");
    }
}
