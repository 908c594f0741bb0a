//! On-disk snapshot store.
//!
//! ## File Layout
//!
//! ```text
//! {dir}/
//! ├── snapshot-{seq}.snap     # Framed snapshot stream
//! ├── snapshot-{seq}.json     # Record: applied index, size, manifest
//! └── snapshot-{seq}.files/   # Copies of the manifest's files
//! ```
//!
//! A snapshot exists only once its record has been atomically renamed into
//! place, so a crash mid-save never leaves a half snapshot that `latest()`
//! could pick up.

use crate::cancel::CancelSignal;
use crate::manifest::FileManifest;
use crate::reader::SnapshotReader;
use crate::sink::{FileSink, FileSource};
use crate::writer::SnapshotWriter;
use common::{SmError, SmResult};
use serde::{Deserialize, Serialize};
use hashbrown::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

const PREFIX: &str = "snapshot-";

/// Persistent record stored next to each snapshot stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    seq: u64,
    index: u64,
    bytes: u64,
    manifest: FileManifest,
}

/// A snapshot that is being written and not yet committed.
#[derive(Debug)]
pub struct PendingSnapshot {
    seq: u64,
    data_path: PathBuf,
}

impl PendingSnapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// A committed snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub seq: u64,
    pub index: u64,
    pub bytes: u64,
    pub data_path: PathBuf,
    pub manifest: FileManifest,
}

/// Directory of committed snapshots, newest kept, oldest pruned.
pub struct SnapshotStore {
    dir: PathBuf,
    keep: usize,
    next_seq: AtomicU64,
}

impl SnapshotStore {
    /// Open or create a store. Leftovers of interrupted saves are removed:
    /// temp files, and stream files or file copies without a record.
    pub fn open(dir: impl AsRef<Path>, keep: usize) -> SmResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut max_seq = 0;
        let mut recorded = HashSet::new();
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(seq) = parse_seq(name) else {
                continue;
            };
            max_seq = max_seq.max(seq);
            if name.ends_with(".json") {
                recorded.insert(seq);
            } else if name.ends_with(".snap") || name.ends_with(".files") {
                candidates.push((seq, path));
            }
        }

        for (seq, path) in candidates {
            if recorded.contains(&seq) {
                continue;
            }
            warn!(path = %path.display(), "removing uncommitted snapshot leftover");
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        Ok(Self {
            dir,
            keep: keep.max(1),
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new snapshot stream backed by a file in the store.
    pub async fn begin(
        &self,
        cancel: CancelSignal,
        chunk_size: usize,
    ) -> SmResult<(SnapshotWriter, PendingSnapshot)> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let data_path = self.data_path(seq);
        let sink = FileSink::create(&data_path).await?;
        let writer = SnapshotWriter::new(sink, cancel, chunk_size);
        Ok((writer, PendingSnapshot { seq, data_path }))
    }

    /// Record a finished stream as a snapshot at `index`.
    ///
    /// Manifest files are copied into the store so the snapshot stays valid
    /// after the producing state machine recycles its own files. On error
    /// the pending snapshot is discarded.
    pub fn commit(
        &self,
        pending: PendingSnapshot,
        index: u64,
        manifest: &FileManifest,
    ) -> SmResult<StoredSnapshot> {
        let record = match self.write_committed(&pending, index, manifest) {
            Ok(record) => record,
            Err(e) => {
                warn!(seq = pending.seq, index, error = %e, "snapshot commit failed");
                self.discard(pending);
                return Err(e);
            }
        };
        info!(seq = record.seq, index, bytes = record.bytes, "snapshot committed to store");

        if let Err(e) = self.prune() {
            warn!(error = %e, "failed to prune old snapshots");
        }
        Ok(self.stored(record))
    }

    /// Drop a pending snapshot that will never be committed.
    pub fn discard(&self, pending: PendingSnapshot) {
        let _ = fs::remove_file(self.record_path(pending.seq));
        let _ = fs::remove_file(self.record_temp_path(pending.seq));
        let _ = fs::remove_file(&pending.data_path);
        let _ = fs::remove_dir_all(self.files_dir(pending.seq));
    }

    /// Committed snapshots, oldest first.
    pub fn list(&self) -> SmResult<Vec<StoredSnapshot>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<SnapshotRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot record"),
            }
        }
        records.sort_by_key(|r| r.seq);
        Ok(records.into_iter().map(|r| self.stored(r)).collect())
    }

    /// The snapshot with the highest applied index (newest on ties).
    pub fn latest(&self) -> SmResult<Option<StoredSnapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .max_by_key(|s| (s.index, s.seq)))
    }

    /// Open a read session over a committed snapshot.
    pub async fn reader(
        &self,
        snapshot: &StoredSnapshot,
        cancel: CancelSignal,
    ) -> SmResult<SnapshotReader> {
        let source = FileSource::open(&snapshot.data_path).await?;
        Ok(SnapshotReader::new(source, cancel))
    }

    fn prune(&self) -> SmResult<()> {
        let snapshots = self.list()?;
        if snapshots.len() <= self.keep {
            return Ok(());
        }
        let excess = snapshots.len() - self.keep;
        for old in snapshots.into_iter().take(excess) {
            fs::remove_file(self.record_path(old.seq))?;
            let _ = fs::remove_file(&old.data_path);
            let _ = fs::remove_dir_all(self.files_dir(old.seq));
            info!(seq = old.seq, index = old.index, "pruned snapshot");
        }
        Ok(())
    }

    fn write_committed(
        &self,
        pending: &PendingSnapshot,
        index: u64,
        manifest: &FileManifest,
    ) -> SmResult<SnapshotRecord> {
        let bytes = fs::metadata(&pending.data_path)
            .map_err(|_| SmError::Snapshot("snapshot stream was not finished".into()))?
            .len();

        let manifest = if manifest.is_empty() {
            FileManifest::new()
        } else {
            manifest.copy_into(self.files_dir(pending.seq))?
        };

        let record = SnapshotRecord {
            seq: pending.seq,
            index,
            bytes,
            manifest,
        };
        self.write_record(&record)?;
        Ok(record)
    }

    fn write_record(&self, record: &SnapshotRecord) -> SmResult<()> {
        let path = self.record_path(record.seq);
        let temp_path = self.record_temp_path(record.seq);

        let contents =
            serde_json::to_string_pretty(record).map_err(|e| SmError::Codec(e.to_string()))?;
        fs::write(&temp_path, &contents)?;

        // Fsync temp file
        let file = File::open(&temp_path)?;
        file.sync_all()?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;

        // Fsync directory
        let dir = File::open(&self.dir)?;
        dir.sync_all()?;
        Ok(())
    }

    fn stored(&self, record: SnapshotRecord) -> StoredSnapshot {
        StoredSnapshot {
            seq: record.seq,
            index: record.index,
            bytes: record.bytes,
            data_path: self.data_path(record.seq),
            manifest: record.manifest,
        }
    }

    fn data_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{seq:020}.snap"))
    }

    fn record_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{seq:020}.json"))
    }

    fn record_temp_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{seq:020}.json.tmp"))
    }

    fn files_dir(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{seq:020}.files"))
    }
}

fn parse_seq(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(PREFIX)?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}
