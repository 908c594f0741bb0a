//! Per-replica host that drives one state machine.
//!
//! The host owns the applied index, enforces log order and the concurrency
//! contract of the machine's [`MachineKind`], filters client session entries,
//! and wraps every snapshot stream in a [`SnapshotHeader`].
//!
//! ## Locking
//!
//! ```text
//! gate (RwLock<()>)        write: every call on a Sequential machine,
//!                                 recover, open, close
//!                          read:  everything else
//! apply (Mutex<Sessions>)  apply, prepare, sync, recover, open
//! ```
//!
//! Locks are always taken gate first, then apply.

use crate::client_session::{NOOP_SERIES_ID, SERIES_ID_FOR_REGISTER, SERIES_ID_FOR_UNREGISTER};
use crate::context::{OutstandingGuard, SnapshotContext};
use crate::lookup::LookupResult;
use crate::machine::{MachineKind, StateMachine};
use crate::sessions::{Outcome, RejectReason, SessionCheck, SessionRegistry};
use common::{Entry, EntryResult, GroupId, HostConfig, MemberId, ReplicaId, SmError, SmResult};
use serde::{Deserialize, Serialize};
use snapshot::{
    CancelSignal, FileManifest, SnapshotReader, SnapshotStore, SnapshotWriter, StoredSnapshot,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Version of the host's snapshot header layout.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Host metadata written at the front of every snapshot stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub group: GroupId,
    pub member: MemberId,
    pub index: u64,
    pub kind: MachineKind,
    /// Encoded client session registry.
    pub sessions: Vec<u8>,
}

/// Result of applying a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied_index: u64,
    /// One outcome per entry, in batch order.
    pub outcomes: Vec<Outcome>,
}

/// A finished snapshot stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedSnapshot {
    pub index: u64,
    pub bytes: u64,
    pub manifest: FileManifest,
}

// Guards are held for their drop, never read.
#[allow(dead_code)]
enum Gate<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

pub struct Host {
    replica: ReplicaId,
    config: HostConfig,
    kind: MachineKind,
    machine: Box<dyn StateMachine>,
    gate: RwLock<()>,
    apply: Mutex<SessionRegistry>,
    applied: AtomicU64,
    opened: AtomicBool,
    closed: AtomicBool,
    halted: OnceLock<String>,
    outstanding: Arc<AtomicBool>,
}

impl Host {
    pub fn create(
        replica: ReplicaId,
        config: HostConfig,
        machine: Box<dyn StateMachine>,
    ) -> SmResult<Self> {
        config.validate()?;
        let kind = machine.kind();
        info!(
            group = replica.group.0,
            member = replica.member.0,
            kind = kind.name(),
            "created state machine host"
        );
        Ok(Self {
            replica,
            kind,
            machine,
            gate: RwLock::new(()),
            apply: Mutex::new(SessionRegistry::new(config.max_client_sessions)),
            applied: AtomicU64::new(0),
            opened: AtomicBool::new(!kind.manages_own_storage()),
            closed: AtomicBool::new(false),
            halted: OnceLock::new(),
            outstanding: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.get().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a self-managed machine's storage and resume from its durable index.
    ///
    /// Calling it again on an opened instance returns the applied index.
    pub async fn open(&self, cancel: &CancelSignal) -> SmResult<u64> {
        self.ensure_serving()?;
        if !self.kind.manages_own_storage() {
            return Err(SmError::Unsupported("open"));
        }
        let _gate = self.gate.write().await;
        let _sessions = self.apply.lock().await;
        if self.opened.load(Ordering::Acquire) {
            return Ok(self.applied_index());
        }
        cancel.check()?;
        let index = self.machine.open(cancel).await?;
        self.applied.store(index, Ordering::Release);
        self.opened.store(true, Ordering::Release);
        info!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index,
            "opened on-disk state machine"
        );
        Ok(index)
    }

    /// Apply a batch of committed entries in log order.
    ///
    /// The first entry must follow the applied index and indices must be
    /// contiguous; anything else halts the instance.
    pub async fn apply(&self, entries: &[Entry]) -> SmResult<ApplyResult> {
        self.ensure_serving()?;
        self.ensure_opened()?;
        let _gate = self.enter().await;
        let mut sessions = self.apply.lock().await;
        self.ensure_serving()?;

        let current = self.applied_index();
        let Some(last) = entries.last() else {
            return Ok(ApplyResult {
                applied_index: current,
                outcomes: Vec::new(),
            });
        };
        for (expected, entry) in (current + 1..).zip(entries) {
            if entry.index != expected {
                return Err(self.halt(SmError::OrderingViolation {
                    expected,
                    got: entry.index,
                }));
            }
        }

        let outcomes = if self.kind.manages_own_storage() {
            self.update_checked(entries)
                .await?
                .into_iter()
                .map(Outcome::Applied)
                .collect()
        } else {
            self.apply_with_sessions(&mut sessions, entries).await?
        };

        self.applied.store(last.index, Ordering::Release);
        debug!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index = last.index,
            entries = entries.len(),
            "applied batch"
        );
        Ok(ApplyResult {
            applied_index: last.index,
            outcomes,
        })
    }

    pub async fn lookup(&self, query: &[u8]) -> SmResult<LookupResult> {
        self.ensure_serving()?;
        self.ensure_opened()?;
        let _gate = self.enter().await;
        self.machine.lookup(query).await
    }

    pub async fn hash(&self) -> SmResult<u64> {
        self.ensure_serving()?;
        self.ensure_opened()?;
        let _gate = self.enter().await;
        self.machine.hash().await
    }

    /// Capture a point-in-time view for a later `save_snapshot`.
    ///
    /// At most one context is outstanding per instance.
    pub async fn prepare_snapshot(&self) -> SmResult<SnapshotContext> {
        self.ensure_serving()?;
        if !self.kind.supports_concurrent_snapshot() {
            return Err(SmError::Unsupported("prepare_snapshot"));
        }
        self.ensure_opened()?;
        let guard = OutstandingGuard::acquire(&self.outstanding)?;
        let _gate = self.gate.read().await;
        let sessions = self.apply.lock().await;
        let index = self.applied_index();
        let encoded = sessions.encode()?;
        let state = self.machine.prepare_snapshot().await?;
        debug!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index,
            "prepared snapshot context"
        );
        Ok(SnapshotContext::new(index, self.replica, encoded, state, guard))
    }

    /// Stream a snapshot into `writer` and finish it.
    ///
    /// Sequential machines take no context and block all other calls.
    /// Concurrent kinds save `context`, preparing one first when it is
    /// `None`, while updates continue. On any error the stream is aborted.
    pub async fn save_snapshot(
        &self,
        context: Option<SnapshotContext>,
        writer: &mut SnapshotWriter,
    ) -> SmResult<SavedSnapshot> {
        if let Err(e) = self.ensure_serving().and_then(|_| self.ensure_opened()) {
            writer.abort().await;
            return Err(e);
        }

        if !self.kind.supports_concurrent_snapshot() {
            if context.is_some() {
                writer.abort().await;
                return Err(SmError::Unsupported(
                    "snapshot context on a sequential state machine",
                ));
            }
            let _gate = self.gate.write().await;
            let sessions = self.apply.lock().await;
            let encoded = match sessions.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    writer.abort().await;
                    return Err(e);
                }
            };
            let header = self.header(self.applied_index(), encoded);
            return self.write_snapshot(header, None, writer).await;
        }

        let context = match context {
            Some(context) if !context.issued_by(&self.outstanding) => {
                writer.abort().await;
                return Err(SmError::Snapshot(format!(
                    "context was prepared by {}, not {}",
                    context.replica(),
                    self.replica
                )));
            }
            Some(context) => context,
            None => match self.prepare_snapshot().await {
                Ok(context) => context,
                Err(e) => {
                    writer.abort().await;
                    return Err(e);
                }
            },
        };
        let _gate = self.gate.read().await;
        let header = self.header(context.index(), context.sessions().to_vec());
        self.write_snapshot(header, Some(context.state()), writer)
            .await
    }

    /// Replace all state with the snapshot read from `reader`.
    ///
    /// `files` is the manifest delivered alongside the stream, already placed
    /// locally. On error or cancellation the previous state stays in place.
    pub async fn recover_from_snapshot(
        &self,
        reader: &mut SnapshotReader,
        files: &FileManifest,
    ) -> SmResult<u64> {
        self.ensure_serving()?;
        let _gate = self.gate.write().await;
        let mut sessions = self.apply.lock().await;
        self.ensure_serving()?;

        match self.restore(reader, files).await {
            Ok((header, restored)) => {
                *sessions = restored;
                self.applied.store(header.index, Ordering::Release);
                self.opened.store(true, Ordering::Release);
                info!(
                    group = self.replica.group.0,
                    member = self.replica.member.0,
                    index = header.index,
                    from_member = header.member.0,
                    "recovered from snapshot"
                );
                Ok(header.index)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    group = self.replica.group.0,
                    member = self.replica.member.0,
                    error = %e,
                    "snapshot recovery abandoned, state unchanged"
                );
                Err(e)
            }
        }
    }

    /// Make everything applied so far durable. Returns the synced index.
    ///
    /// A failed sync halts the instance.
    pub async fn sync(&self) -> SmResult<u64> {
        self.ensure_serving()?;
        if !self.kind.manages_own_storage() {
            return Err(SmError::Unsupported("sync"));
        }
        self.ensure_opened()?;
        let _gate = self.gate.read().await;
        let _sessions = self.apply.lock().await;
        let index = self.applied_index();
        if let Err(e) = self.machine.sync().await {
            return Err(self.halt(SmError::SyncFailed(e.to_string())));
        }
        debug!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index,
            "synced"
        );
        Ok(index)
    }

    /// Close the machine. Later calls fail; closing twice is a no-op.
    pub async fn close(&self) -> SmResult<()> {
        let _gate = self.gate.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index = self.applied_index(),
            "closing state machine"
        );
        self.machine.close().await
    }

    /// Save a snapshot into `store` and commit it.
    pub async fn snapshot_to_store(
        &self,
        store: &SnapshotStore,
        cancel: CancelSignal,
    ) -> SmResult<StoredSnapshot> {
        let context = if self.kind.supports_concurrent_snapshot() {
            Some(self.prepare_snapshot().await?)
        } else {
            None
        };
        let (mut writer, pending) = store
            .begin(cancel, self.config.snapshot_chunk_size)
            .await?;
        match self.save_snapshot(context, &mut writer).await {
            Ok(saved) => store.commit(pending, saved.index, &saved.manifest),
            Err(e) => {
                store.discard(pending);
                Err(e)
            }
        }
    }

    /// Recover from a snapshot committed to `store`.
    pub async fn recover_from_store(
        &self,
        store: &SnapshotStore,
        snapshot: &StoredSnapshot,
        cancel: CancelSignal,
    ) -> SmResult<u64> {
        let mut reader = store.reader(snapshot, cancel).await?;
        self.recover_from_snapshot(&mut reader, &snapshot.manifest)
            .await
    }

    async fn enter(&self) -> Gate<'_> {
        if self.kind.supports_concurrent_snapshot() {
            Gate::Shared(self.gate.read().await)
        } else {
            Gate::Exclusive(self.gate.write().await)
        }
    }

    fn ensure_serving(&self) -> SmResult<()> {
        if let Some(reason) = self.halted.get() {
            return Err(SmError::Halted(reason.clone()));
        }
        if self.is_closed() {
            return Err(SmError::Halted("instance closed".into()));
        }
        Ok(())
    }

    fn ensure_opened(&self) -> SmResult<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SmError::NotOpened)
        }
    }

    /// Mark the instance as no longer serving and hand back `err`.
    fn halt(&self, err: SmError) -> SmError {
        let reason = err.to_string();
        if self.halted.set(reason).is_ok() {
            error!(
                group = self.replica.group.0,
                member = self.replica.member.0,
                index = self.applied_index(),
                error = %err,
                "state machine halted"
            );
        }
        err
    }

    async fn update_checked(&self, entries: &[Entry]) -> SmResult<Vec<EntryResult>> {
        let results = match self.machine.update(entries).await {
            Ok(results) => results,
            Err(e) => {
                return Err(self.halt(SmError::Halted(format!(
                    "update of entries {}..={} failed: {e}",
                    entries[0].index,
                    entries[entries.len() - 1].index
                ))))
            }
        };
        if results.len() != entries.len() {
            return Err(self.halt(SmError::Halted(format!(
                "update returned {} results for {} entries",
                results.len(),
                entries.len()
            ))));
        }
        Ok(results)
    }

    /// Session-free entries go to the machine in runs; every session entry
    /// is checked and applied on its own so the registry sees log order.
    async fn apply_with_sessions(
        &self,
        sessions: &mut SessionRegistry,
        entries: &[Entry],
    ) -> SmResult<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut run_start = 0;
        for (i, entry) in entries.iter().enumerate() {
            if entry.is_session_free() || entry.series_id == NOOP_SERIES_ID {
                continue;
            }
            if run_start < i {
                let results = self.update_checked(&entries[run_start..i]).await?;
                outcomes.extend(results.into_iter().map(Outcome::Applied));
            }
            run_start = i + 1;
            outcomes.push(self.apply_session_entry(sessions, entry).await?);
        }
        if run_start < entries.len() {
            let results = self.update_checked(&entries[run_start..]).await?;
            outcomes.extend(results.into_iter().map(Outcome::Applied));
        }
        Ok(outcomes)
    }

    async fn apply_session_entry(
        &self,
        sessions: &mut SessionRegistry,
        entry: &Entry,
    ) -> SmResult<Outcome> {
        let client_id = entry.client_id;
        let outcome = match entry.series_id {
            SERIES_ID_FOR_REGISTER => {
                if sessions.register(client_id) {
                    Outcome::Registered
                } else {
                    Outcome::Rejected(RejectReason::SessionExists)
                }
            }
            SERIES_ID_FOR_UNREGISTER => {
                if sessions.unregister(client_id) {
                    Outcome::Unregistered
                } else {
                    Outcome::Rejected(RejectReason::SessionNotFound)
                }
            }
            series_id => match sessions.check(client_id, series_id, entry.responded_to) {
                SessionCheck::NotRegistered => Outcome::Rejected(RejectReason::SessionNotFound),
                SessionCheck::Responded => Outcome::Rejected(RejectReason::AlreadyResponded),
                SessionCheck::Duplicate(result) => Outcome::Duplicate(result),
                SessionCheck::New => {
                    let mut results = self.update_checked(std::slice::from_ref(entry)).await?;
                    let result = results.pop().unwrap_or_default();
                    sessions.record(client_id, series_id, result.clone());
                    Outcome::Applied(result)
                }
            },
        };
        if let Outcome::Rejected(reason) = &outcome {
            debug!(client_id, index = entry.index, ?reason, "session entry rejected");
        }
        Ok(outcome)
    }

    fn header(&self, index: u64, sessions: Vec<u8>) -> SnapshotHeader {
        SnapshotHeader {
            version: SNAPSHOT_FORMAT_VERSION,
            group: self.replica.group,
            member: self.replica.member,
            index,
            kind: self.kind,
            sessions,
        }
    }

    async fn write_snapshot(
        &self,
        header: SnapshotHeader,
        view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
    ) -> SmResult<SavedSnapshot> {
        let index = header.index;
        info!(
            group = self.replica.group.0,
            member = self.replica.member.0,
            index,
            "saving snapshot"
        );
        match self.stream_snapshot(&header, view, writer).await {
            Ok((bytes, manifest)) => {
                info!(
                    group = self.replica.group.0,
                    member = self.replica.member.0,
                    index,
                    bytes,
                    files = manifest.len(),
                    "snapshot saved"
                );
                Ok(SavedSnapshot {
                    index,
                    bytes,
                    manifest,
                })
            }
            Err(e) => {
                writer.abort().await;
                warn!(
                    group = self.replica.group.0,
                    member = self.replica.member.0,
                    index,
                    error = %e,
                    "snapshot save abandoned"
                );
                Err(e)
            }
        }
    }

    async fn stream_snapshot(
        &self,
        header: &SnapshotHeader,
        view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
    ) -> SmResult<(u64, FileManifest)> {
        writer.cancel_signal().check()?;
        writer.write_value(header).await?;
        let mut manifest = FileManifest::new();
        self.machine
            .save_snapshot(view, writer, &mut manifest)
            .await?;
        let bytes = writer.finish().await?;
        Ok((bytes, manifest))
    }

    /// Everything up to the machine's swap is recoverable; a stream failure
    /// after the machine reported success is not.
    async fn restore(
        &self,
        reader: &mut SnapshotReader,
        files: &FileManifest,
    ) -> SmResult<(SnapshotHeader, SessionRegistry)> {
        reader.cancel_signal().check()?;
        let header: SnapshotHeader = reader.read_value().await?;
        if header.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SmError::Snapshot(format!(
                "unsupported snapshot format version {}",
                header.version
            )));
        }
        if header.group != self.replica.group {
            return Err(SmError::GroupMismatch {
                expected: self.replica.group.0,
                got: header.group.0,
            });
        }
        if header.kind != self.kind {
            return Err(SmError::Snapshot(format!(
                "snapshot of a {} machine cannot restore a {} machine",
                header.kind.name(),
                self.kind.name()
            )));
        }
        files.validate_present()?;
        let restored = if self.kind.manages_own_storage() {
            SessionRegistry::new(self.config.max_client_sessions)
        } else {
            SessionRegistry::decode(&header.sessions, self.config.max_client_sessions)?
        };

        self.machine.recover_from_snapshot(reader, files).await?;

        if let Err(e) = reader.finish().await {
            return Err(self.halt(SmError::Halted(format!(
                "snapshot stream failed after state was replaced: {e}"
            ))));
        }
        Ok((header, restored))
    }
}
