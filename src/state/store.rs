//! The state store.
//!
//! [`StateStore`] holds the desired, prior and observed snapshots of every
//! resource in a run. It never writes on its own: nothing reaches the
//! persistence backend until [`StateStore::persist`] is called.
//!
//! During an apply, each resource being worked on is checked out of the
//! store and owned by exactly one running operation. The store keeps a
//! snapshot in its place, so a persist while operations are in flight still
//! writes the last confirmed state of every resource.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};
use crate::value::Block;

use super::backend::PersistenceBackend;
use super::lock::{LockInfo, LockPurpose};
use super::memory::MemoryBackend;
use super::types::{HistoryEntry, ResourceState, StateDocument, STATE_VERSION, MAX_HISTORY};

#[derive(Debug)]
enum Slot {
    Present(ResourceState),
    CheckedOut(ResourceState),
}

/// Resource state for a run, backed by a persistence backend.
pub struct StateStore {
    backend: Box<dyn PersistenceBackend>,
    serial: u64,
    history: Vec<HistoryEntry>,
    slots: BTreeMap<String, Slot>,
    lock: Option<LockInfo>,
}

impl StateStore {
    /// Opens the store, loading the last persisted document if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read or was written by an
    /// incompatible version.
    pub async fn open(backend: impl PersistenceBackend + 'static) -> Result<Self> {
        let backend: Box<dyn PersistenceBackend> = Box::new(backend);
        let document = backend.load().await?;

        let Some(document) = document else {
            debug!("No persisted state in {} backend", backend.backend_type());
            return Ok(Self::empty(backend));
        };

        if !document.is_compatible() {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: document.version,
            }));
        }

        info!(
            "Loaded state serial {} with {} resources",
            document.serial,
            document.resources.len()
        );

        let slots = document
            .resources
            .into_iter()
            .map(|(name, state)| (name, Slot::Present(state)))
            .collect();

        Ok(Self {
            backend,
            serial: document.serial,
            history: document.history,
            slots,
            lock: None,
        })
    }

    /// Creates an empty store that persists to memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::empty(Box::new(MemoryBackend::new()))
    }

    fn empty(backend: Box<dyn PersistenceBackend>) -> Self {
        Self {
            backend,
            serial: 0,
            history: Vec::new(),
            slots: BTreeMap::new(),
            lock: None,
        }
    }

    /// Sets all three snapshots of a resource, creating its entry if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CheckedOut`] if the resource is owned by a
    /// running operation.
    pub fn load(
        &mut self,
        name: &str,
        resource_type: &str,
        desired: Option<Block>,
        prior: Option<Block>,
        observed: Option<Block>,
    ) -> Result<()> {
        let state = self.entry(name, resource_type)?;
        state.desired = desired;
        state.prior = prior;
        state.observed = observed;
        Ok(())
    }

    /// Sets the desired snapshot of a resource, keeping what is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CheckedOut`] if the resource is owned by a
    /// running operation.
    pub fn set_desired(&mut self, name: &str, resource_type: &str, desired: Block) -> Result<()> {
        let state = self.entry(name, resource_type)?;
        if state.resource_type != resource_type {
            warn!(
                "Resource {name} changed type from {} to {resource_type}",
                state.resource_type
            );
            state.resource_type = resource_type.to_string();
        }
        state.desired = Some(desired);
        Ok(())
    }

    /// Replaces the prior snapshot of a resource.
    ///
    /// Callers pass only what the remote system confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource is unknown or checked out.
    pub fn commit(&mut self, name: &str, prior: Block) -> Result<()> {
        self.get_mut(name)?.commit(prior);
        debug!("Committed prior state for {name}");
        Ok(())
    }

    /// The external identifier of a resource, if it exists remotely.
    #[must_use]
    pub fn current_identifier(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ResourceState::current_identifier)
    }

    /// Looks up a resource. Checked-out resources return their snapshot.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.slots.get(name).map(|slot| match slot {
            Slot::Present(state) | Slot::CheckedOut(state) => state,
        })
    }

    /// Looks up a resource for modification.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource is unknown or checked out.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut ResourceState> {
        match self.slots.get_mut(name) {
            Some(Slot::Present(state)) => Ok(state),
            Some(Slot::CheckedOut(_)) => Err(checked_out(name)),
            None => Err(ConvergeError::State(StateError::UnknownResource {
                name: name.to_string(),
            })),
        }
    }

    /// All resources, ordered by name.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.slots.values().map(|slot| match slot {
            Slot::Present(state) | Slot::CheckedOut(state) => state,
        })
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no resources are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes a resource from state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CheckedOut`] if the resource is owned by a
    /// running operation.
    pub fn remove(&mut self, name: &str) -> Result<Option<ResourceState>> {
        match self.slots.remove(name) {
            Some(Slot::CheckedOut(snapshot)) => {
                self.slots.insert(name.to_string(), Slot::CheckedOut(snapshot));
                Err(checked_out(name))
            }
            Some(Slot::Present(state)) => {
                debug!("Removed {name} from state");
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Hands a resource to a running operation.
    pub(crate) fn checkout(&mut self, name: &str) -> Result<ResourceState> {
        let state = self.get_mut(name)?.clone();
        self.slots
            .insert(name.to_string(), Slot::CheckedOut(state.clone()));
        Ok(state)
    }

    /// Returns a resource from a finished operation.
    pub(crate) fn checkin(&mut self, state: ResourceState) {
        self.slots.insert(state.name.clone(), Slot::Present(state));
    }

    /// Puts back the snapshot of a resource whose operation was lost.
    ///
    /// Returns `None` if the resource is unknown.
    pub(crate) fn release(&mut self, name: &str) -> Option<&mut ResourceState> {
        let slot = self.slots.get_mut(name)?;
        if let Slot::CheckedOut(snapshot) = slot {
            *slot = Slot::Present(snapshot.clone());
        }
        match slot {
            Slot::Present(state) => Some(state),
            Slot::CheckedOut(_) => None,
        }
    }

    /// Returns true if a running operation owns the resource.
    #[must_use]
    pub fn is_checked_out(&self, name: &str) -> bool {
        matches!(self.slots.get(name), Some(Slot::CheckedOut(_)))
    }

    /// Builds the document that [`StateStore::persist`] would write.
    #[must_use]
    pub fn document(&self) -> StateDocument {
        let mut document = StateDocument::new();
        document.serial = self.serial;
        document.history.clone_from(&self.history);
        document.resources = self
            .resources()
            .map(|state| (state.name.clone(), state.clone()))
            .collect();
        document
    }

    /// Writes the current state to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn persist(&mut self) -> Result<()> {
        self.serial += 1;
        let document = self.document();
        self.backend.save(&document).await?;
        debug!("Persisted state serial {}", self.serial);
        Ok(())
    }

    /// Appends an entry to the apply history.
    pub fn record_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Apply history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Serial of the last persisted document.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Takes the backend lock for this store. Does nothing if already held.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if another process holds it.
    pub async fn lock(&mut self, purpose: LockPurpose) -> Result<()> {
        if self.lock.is_none() {
            let lock = LockInfo::for_current_process(purpose);
            self.lock = Some(self.backend.acquire_lock(lock).await?);
        }
        Ok(())
    }

    /// Returns true if this store holds the backend lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Releases the backend lock if this store holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot release the lock.
    pub async fn unlock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            self.backend.release_lock(&lock.lock_id).await?;
        }
        Ok(())
    }

    /// Releases a lock held by another process.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot release the lock.
    pub async fn force_unlock(&self, lock_id: &str) -> Result<()> {
        warn!("Force-releasing state lock {lock_id}");
        self.backend.release_lock(lock_id).await
    }

    /// Current lock on the backend, held by anyone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.backend.get_lock_info().await
    }

    /// Name of the persistence backend.
    #[must_use]
    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    fn entry(&mut self, name: &str, resource_type: &str) -> Result<&mut ResourceState> {
        if !self.slots.contains_key(name) {
            self.slots.insert(
                name.to_string(),
                Slot::Present(ResourceState::new(name, resource_type)),
            );
        }
        self.get_mut(name)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.backend_type())
            .field("serial", &self.serial)
            .field("resources", &self.slots.len())
            .finish_non_exhaustive()
    }
}

fn checked_out(name: &str) -> ConvergeError {
    ConvergeError::State(StateError::CheckedOut {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalBackend;
    use crate::value::Value;

    fn block(size: &str) -> Block {
        [(String::from("vm_size"), Value::string(size))].into()
    }

    #[test]
    fn test_load_and_commit() {
        let mut store = StateStore::in_memory();
        store
            .load("vm1", "virtual_machine", Some(block("A2")), Some(block("A1")), None)
            .unwrap();

        let vm = store.get("vm1").unwrap();
        assert_eq!(vm.desired, Some(block("A2")));
        assert_eq!(vm.prior, Some(block("A1")));
        assert!(store.current_identifier("vm1").is_none());

        store.commit("vm1", block("A2")).unwrap();
        assert_eq!(store.get("vm1").unwrap().prior, Some(block("A2")));
        assert!(store.commit("missing", block("A2")).is_err());
    }

    #[test]
    fn test_checked_out_resource_is_read_only() {
        let mut store = StateStore::in_memory();
        store.set_desired("vm1", "virtual_machine", block("A1")).unwrap();

        let mut owned = store.checkout("vm1").unwrap();
        assert!(store.is_checked_out("vm1"));
        assert!(store.get("vm1").is_some());
        assert!(matches!(
            store.commit("vm1", block("A2")),
            Err(ConvergeError::State(StateError::CheckedOut { .. }))
        ));
        assert!(store.remove("vm1").is_err());
        assert!(store.checkout("vm1").is_err());

        owned.record_created(String::from("/vms/vm1"), block("A1"));
        store.checkin(owned);
        assert!(!store.is_checked_out("vm1"));
        assert_eq!(store.current_identifier("vm1"), Some("/vms/vm1"));
    }

    #[test]
    fn test_release_restores_snapshot() {
        let mut store = StateStore::in_memory();
        store.set_desired("vm1", "virtual_machine", block("A1")).unwrap();
        let mut owned = store.checkout("vm1").unwrap();
        owned.commit(block("A9"));
        drop(owned);

        let restored = store.release("vm1").unwrap();
        assert!(restored.prior.is_none());
        assert!(!store.is_checked_out("vm1"));
        assert!(store.release("missing").is_none());
    }

    #[tokio::test]
    async fn test_persist_writes_snapshot_of_checked_out_resources() {
        let backend = MemoryBackend::new();
        let mut store = StateStore::open(backend.clone()).await.unwrap();
        store.set_desired("vm1", "virtual_machine", block("A1")).unwrap();
        store.commit("vm1", block("A0")).unwrap();

        let mut owned = store.checkout("vm1").unwrap();
        owned.commit(block("A1"));
        store.persist().await.unwrap();

        let written = backend.document().await.unwrap();
        assert_eq!(written.serial, 1);
        assert_eq!(written.resources["vm1"].prior, Some(block("A0")));
    }

    #[tokio::test]
    async fn test_reopen_restores_prior_not_desired() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut store = StateStore::open(LocalBackend::with_base_dir(temp.path()))
            .await
            .unwrap();
        store.set_desired("vm1", "virtual_machine", block("A1")).unwrap();
        store.commit("vm1", block("A1")).unwrap();
        store.record_history(HistoryEntry::new(vec![String::from("vm1")], Vec::new(), false));
        store.persist().await.unwrap();

        let reopened = StateStore::open(LocalBackend::with_base_dir(temp.path()))
            .await
            .unwrap();
        let vm = reopened.get("vm1").unwrap();
        assert!(vm.desired.is_none());
        assert_eq!(vm.prior, Some(block("A1")));
        assert_eq!(reopened.serial(), 1);
        assert_eq!(reopened.history().len(), 1);
        assert_eq!(reopened.backend_type(), "local");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut store = StateStore::in_memory();
        for i in 0..(MAX_HISTORY + 5) {
            store.record_history(HistoryEntry::new(vec![format!("r{i}")], Vec::new(), false));
        }
        assert_eq!(store.history().len(), MAX_HISTORY);
        assert_eq!(store.history()[0].applied, vec![String::from("r5")]);
        assert!(store.history()[0].success());
        assert_eq!(store.document().history.len(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn test_incompatible_version_is_rejected() {
        let mut document = StateDocument::new();
        document.version = String::from("9.0");
        let err = StateStore::open(MemoryBackend::with_document(document))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        let mut first = StateStore::open(backend.clone()).await.unwrap();
        let mut second = StateStore::open(backend.clone()).await.unwrap();

        first.lock(LockPurpose::Apply).await.unwrap();
        first.lock(LockPurpose::Apply).await.unwrap();
        assert!(second.lock(LockPurpose::Refresh).await.is_err());

        first.unlock().await.unwrap();
        second.lock(LockPurpose::StateEdit).await.unwrap();
        let held = second.lock_info().await.unwrap().unwrap();
        assert_eq!(held.purpose, LockPurpose::StateEdit);
        first.force_unlock(&held.lock_id).await.unwrap();
        assert!(first.lock_info().await.unwrap().is_none());
    }
}
