//! In-memory persistence backend.
//!
//! Used when the caller persists state elsewhere, and in tests. Clones share
//! the same storage, so a test can keep a handle and inspect every write.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;

use super::backend::PersistenceBackend;
use super::lock::{ensure_free, LockInfo};
use super::types::StateDocument;

#[derive(Debug, Default)]
struct Inner {
    document: Option<StateDocument>,
    lock: Option<LockInfo>,
    writes: u64,
}

/// Persistence backend that keeps the document in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-seeded with a document.
    #[must_use]
    pub fn with_document(document: StateDocument) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                document: Some(document),
                ..Inner::default()
            })),
        }
    }

    /// Returns a copy of the last saved document.
    pub async fn document(&self) -> Option<StateDocument> {
        self.inner.lock().await.document.clone()
    }

    /// Number of saves performed.
    pub async fn writes(&self) -> u64 {
        self.inner.lock().await.writes
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<StateDocument>> {
        Ok(self.inner.lock().await.document.clone())
    }

    async fn save(&self, document: &StateDocument) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.document = Some(document.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.inner.lock().await.document.is_some())
    }

    async fn acquire_lock(&self, lock: LockInfo) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        ensure_free(inner.lock.as_ref())?;
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LockPurpose;

    #[tokio::test]
    async fn test_clones_share_storage() {
        let backend = MemoryBackend::new();
        let handle = backend.clone();

        backend.save(&StateDocument::new()).await.unwrap();
        assert!(handle.exists().await.unwrap());
        assert_eq!(handle.writes().await, 1);
    }

    #[tokio::test]
    async fn test_lock_conflict_and_release() {
        let backend = MemoryBackend::new();
        let lock = backend
            .acquire_lock(LockInfo::new("a", LockPurpose::Apply))
            .await
            .unwrap();
        assert!(backend
            .acquire_lock(LockInfo::new("b", LockPurpose::Refresh))
            .await
            .is_err());

        backend.release_lock("someone-else").await.unwrap();
        assert!(backend.get_lock_info().await.unwrap().is_some());

        backend.release_lock(&lock.lock_id).await.unwrap();
        assert!(backend
            .acquire_lock(LockInfo::new("b", LockPurpose::Refresh))
            .await
            .is_ok());
    }
}
