//! State management.
//!
//! This module keeps the desired, prior-applied and observed snapshots of
//! every resource, and persists what has been confirmed between runs:
//! - [`StateStore`], the in-run store with per-resource checkout
//! - [`PersistenceBackend`] with local-file and in-memory implementations
//! - the state lock guarding concurrent runs

mod backend;
mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use backend::PersistenceBackend;
pub use local::{LocalBackend, STATE_DIR};
pub use lock::{ensure_free, generate_holder_id, LockInfo, LockPurpose, LOCK_EXPIRY_SECS};
pub use memory::MemoryBackend;
pub use store::StateStore;
pub use types::{
    ApplyStatus, HistoryEntry, PendingOperation, ResourceState, StateDocument, MAX_HISTORY,
    STATE_VERSION,
};
