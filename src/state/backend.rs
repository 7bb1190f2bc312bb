//! Persistence backend trait.
//!
//! A backend durably stores the [`StateDocument`] between runs and guards it
//! with a lock. The engine only ever reaches persistence through
//! [`StateStore`](super::StateStore).

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::StateDocument;

/// Trait for state persistence backends.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Loads the state document.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateDocument>>;

    /// Saves the state document.
    async fn save(&self, document: &StateDocument) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Records `lock` as the lock on the state.
    ///
    /// Fails with [`StateError::LockedByOther`](crate::error::StateError::LockedByOther)
    /// while an unexpired lock is held.
    async fn acquire_lock(&self, lock: LockInfo) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` matches the current holder.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl PersistenceBackend for Box<dyn PersistenceBackend> {
    async fn load(&self) -> Result<Option<StateDocument>> {
        (**self).load().await
    }

    async fn save(&self, document: &StateDocument) -> Result<()> {
        (**self).save(document).await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, lock: LockInfo) -> Result<LockInfo> {
        (**self).acquire_lock(lock).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
