//! The state machine capability set.

use crate::lookup::LookupResult;
use async_trait::async_trait;
use common::{Entry, EntryResult, SmError, SmResult};
use serde::{Deserialize, Serialize};
use snapshot::{CancelSignal, FileManifest, SnapshotReader, SnapshotWriter};
use std::any::Any;

/// Opaque point-in-time view produced by `prepare_snapshot`.
pub type SnapshotState = Box<dyn Any + Send + Sync>;

/// Which concurrency and storage contract a state machine follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineKind {
    /// Everything runs one at a time; snapshots stop the world.
    Sequential,
    /// Snapshots are prepared then saved while updates continue.
    Concurrent,
    /// Like `Concurrent`, and the machine persists its own state.
    SelfManaged,
}

impl MachineKind {
    pub fn supports_concurrent_snapshot(self) -> bool {
        !matches!(self, MachineKind::Sequential)
    }

    pub fn manages_own_storage(self) -> bool {
        matches!(self, MachineKind::SelfManaged)
    }

    pub fn name(self) -> &'static str {
        match self {
            MachineKind::Sequential => "sequential",
            MachineKind::Concurrent => "concurrent",
            MachineKind::SelfManaged => "self-managed",
        }
    }
}

/// User logic driven by a [`Host`](crate::Host).
///
/// All methods take `&self`; the host enforces the concurrency contract of
/// [`kind`](StateMachine::kind):
///
/// - `Sequential`: at most one call of any kind is in flight.
/// - `Concurrent` / `SelfManaged`: `update` calls never overlap each other;
///   `lookup` and `hash` may overlap `update`; `save_snapshot` overlaps
///   `update` and must only read the prepared view.
/// - `recover_from_snapshot` and `open` always run alone.
///
/// Optional capabilities default to `SmError::Unsupported`.
#[async_trait]
pub trait StateMachine: Send + Sync {
    fn kind(&self) -> MachineKind;

    /// Open private storage and report the highest durable index.
    ///
    /// Self-managed machines only. Must be idempotent across crash/restart.
    async fn open(&self, _cancel: &CancelSignal) -> SmResult<u64> {
        Err(SmError::Unsupported("open"))
    }

    /// Apply entries in order, returning one result per entry.
    ///
    /// An error here is fatal for the instance.
    async fn update(&self, entries: &[Entry]) -> SmResult<Vec<EntryResult>>;

    /// Read-only query.
    async fn lookup(&self, query: &[u8]) -> SmResult<LookupResult>;

    /// Fingerprint of the logical state; equal states hash equal.
    async fn hash(&self) -> SmResult<u64>;

    /// Capture a point-in-time view without blocking later updates.
    ///
    /// The host holds the update lock for the duration of this call.
    async fn prepare_snapshot(&self) -> SmResult<SnapshotState> {
        Err(SmError::Unsupported("prepare_snapshot"))
    }

    /// Serialize state to `writer`, and list loose files in `files`.
    ///
    /// `view` is the prepared view for concurrent kinds and `None` for
    /// sequential machines, which serialize their live state.
    async fn save_snapshot(
        &self,
        view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
        files: &mut FileManifest,
    ) -> SmResult<()>;

    /// Replace all state with the snapshot's, atomically.
    ///
    /// On error the previous state must remain untouched. Implementations
    /// should drain `reader` with `finish()` before making new state visible.
    async fn recover_from_snapshot(
        &self,
        reader: &mut SnapshotReader,
        files: &FileManifest,
    ) -> SmResult<()>;

    /// Force buffered mutations to durable storage. Self-managed only.
    async fn sync(&self) -> SmResult<()> {
        Err(SmError::Unsupported("sync"))
    }

    /// Release resources. Called once when the instance is destroyed.
    async fn close(&self) -> SmResult<()> {
        Ok(())
    }
}

/// Downcast a prepared view handed to `save_snapshot`.
pub fn view_as<T: 'static>(view: Option<&(dyn Any + Send + Sync)>) -> SmResult<&T> {
    view.and_then(|v| v.downcast_ref::<T>())
        .ok_or_else(|| SmError::Snapshot("missing or foreign snapshot view".into()))
}
