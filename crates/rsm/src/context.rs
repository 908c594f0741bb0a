//! Snapshot contexts: prepared views consumed once by a save.

use crate::machine::SnapshotState;
use common::{ReplicaId, SmError, SmResult};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marks that a context is outstanding for one host; cleared on drop.
pub(crate) struct OutstandingGuard {
    flag: Arc<AtomicBool>,
}

impl OutstandingGuard {
    /// Claim the flag, failing if another context holds it.
    pub(crate) fn acquire(flag: &Arc<AtomicBool>) -> SmResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SmError::SnapshotInProgress)?;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Immutable point-in-time view of a state machine at `index`.
///
/// Dropping the context releases it; saving consumes it.
pub struct SnapshotContext {
    index: u64,
    replica: ReplicaId,
    sessions: Vec<u8>,
    state: SnapshotState,
    guard: OutstandingGuard,
}

impl SnapshotContext {
    pub(crate) fn new(
        index: u64,
        replica: ReplicaId,
        sessions: Vec<u8>,
        state: SnapshotState,
        guard: OutstandingGuard,
    ) -> Self {
        Self {
            index,
            replica,
            sessions,
            state,
            guard,
        }
    }

    /// Applied index the view reflects.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Abandon the context without saving.
    pub fn release(self) {}

    pub(crate) fn sessions(&self) -> &[u8] {
        &self.sessions
    }

    pub(crate) fn state(&self) -> &(dyn Any + Send + Sync) {
        self.state.as_ref()
    }

    pub(crate) fn issued_by(&self, flag: &Arc<AtomicBool>) -> bool {
        Arc::ptr_eq(&self.guard.flag, flag)
    }
}

impl fmt::Debug for SnapshotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotContext")
            .field("index", &self.index)
            .field("replica", &self.replica)
            .finish_non_exhaustive()
    }
}
