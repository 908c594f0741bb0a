//! Key/value store that keeps its own durable state.
//!
//! ## File Layout
//!
//! ```text
//! {dir}/
//! ├── CURRENT                      # JSON: generation, checkpoint, wal
//! ├── checkpoint-{index:020}.ckpt  # Immutable map as of `index`
//! └── wal-{generation:020}.log     # Commands applied after the checkpoint
//! ```
//!
//! Checkpoints and WAL records share one framing:
//!
//! ```text
//! magic: u32 | checksum: u32 (CRC32 of payload) | length: u32 | payload (bincode)
//! ```
//!
//! `CURRENT` only ever changes by atomic rename, so a crash leaves either the
//! old or the new generation in effect. Snapshots hand out checkpoint files
//! through the manifest; the stream itself carries only a small descriptor.

use crate::state::{apply_cmd, lookup, state_hash, KvMap};
use async_trait::async_trait;
use common::{Entry, EntryResult, SmError, SmResult};
use rsm::{view_as, LookupResult, MachineKind, SnapshotState, StateMachine};
use serde::{Deserialize, Serialize};
use snapshot::codec::{decode_value, encode_value};
use snapshot::{CancelSignal, FileManifest, SnapshotReader, SnapshotWriter};
use std::any::Any;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const RECORD_MAGIC: u32 = 0x4B56_4C47; // "KVLG"
const RECORD_HEADER_SIZE: usize = 12;
const MAX_RECORD_LEN: u32 = 256 * 1024 * 1024;
const CURRENT_FILE: &str = "CURRENT";
const CHECKPOINT_FILE_ID: u64 = 1;
/// Replayed records between cancellation checks.
const REPLAY_CANCEL_INTERVAL: usize = 1024;

/// Which checkpoint and WAL make up the live state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CurrentRecord {
    generation: u64,
    checkpoint: Option<String>,
    wal: String,
}

impl CurrentRecord {
    fn initial() -> Self {
        Self {
            generation: 0,
            checkpoint: None,
            wal: wal_name(0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WalRecord {
    index: u64,
    cmd: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    index: u64,
    map: KvMap,
}

/// What the snapshot stream carries next to the checkpoint file.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDescriptor {
    index: u64,
    keys: u64,
    file_id: u64,
}

/// Point-in-time view handed from prepare to save.
struct DiskView {
    index: u64,
    map: Arc<KvMap>,
}

struct RecordHeader {
    magic: u32,
    checksum: u32,
    length: u32,
}

impl RecordHeader {
    fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Self {
            magic: word(0),
            checksum: word(4),
            length: word(8),
        }
    }
}

fn frame_record(payload: &[u8]) -> SmResult<Vec<u8>> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| SmError::Machine(format!("record of {} bytes too large", payload.len())))?;
    let header = RecordHeader {
        magic: RECORD_MAGIC,
        checksum: crc32fast::hash(payload),
        length,
    };
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Next intact record, or `None` at end of input or at a torn record.
fn next_record(input: &mut impl Read) -> SmResult<Option<Vec<u8>>> {
    let mut buf = [0u8; RECORD_HEADER_SIZE];
    match input.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = RecordHeader::from_bytes(&buf);
    if header.magic != RECORD_MAGIC || header.length > MAX_RECORD_LEN {
        warn!(magic = header.magic, length = header.length, "invalid record header");
        return Ok(None);
    }
    let mut payload = vec![0u8; header.length as usize];
    match input.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if crc32fast::hash(&payload) != header.checksum {
        warn!(length = header.length, "record checksum mismatch");
        return Ok(None);
    }
    Ok(Some(payload))
}

fn checkpoint_name(index: u64) -> String {
    format!("checkpoint-{index:020}.ckpt")
}

fn wal_name(generation: u64) -> String {
    format!("wal-{generation:020}.log")
}

/// Temp file, fsync, rename, fsync directory.
fn write_atomically(dir: &Path, path: &Path, contents: &[u8]) -> SmResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)?;

    // Fsync temp file
    let file = File::open(&temp_path)?;
    file.sync_all()?;

    // Atomic rename
    fs::rename(&temp_path, path)?;

    // Fsync directory
    let dir = File::open(dir)?;
    dir.sync_all()?;
    Ok(())
}

fn read_current(dir: &Path) -> SmResult<Option<CurrentRecord>> {
    match fs::read_to_string(dir.join(CURRENT_FILE)) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| SmError::Corrupted(format!("unreadable {CURRENT_FILE}: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_current(dir: &Path, current: &CurrentRecord) -> SmResult<()> {
    let contents =
        serde_json::to_string_pretty(current).map_err(|e| SmError::Codec(e.to_string()))?;
    write_atomically(dir, &dir.join(CURRENT_FILE), contents.as_bytes())
}

fn write_checkpoint(dir: &Path, path: &Path, index: u64, map: &KvMap) -> SmResult<()> {
    #[derive(Serialize)]
    struct CheckpointRef<'a> {
        index: u64,
        map: &'a KvMap,
    }
    let payload = encode_value(&CheckpointRef { index, map })?;
    write_atomically(dir, path, &frame_record(&payload)?)
}

fn read_checkpoint(path: &Path) -> SmResult<Checkpoint> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SmError::MissingFile(path.to_path_buf())
        } else {
            SmError::Io(e)
        }
    })?;
    let mut input = BufReader::new(file);
    let payload = next_record(&mut input)?.ok_or_else(|| {
        SmError::Corrupted(format!("checkpoint {} is damaged", path.display()))
    })?;
    decode_value(&payload)
}

fn remove_temp_files(dir: &Path) -> SmResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Append-only command log.
struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Wal {
    fn open(path: &Path) -> SmResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// A new, empty and durable log.
    fn create(dir: &Path, path: &Path) -> SmResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.sync_all()?;
        File::open(dir)?.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Buffered; durable only after `sync`.
    fn append(&mut self, record: &WalRecord) -> SmResult<()> {
        let payload = encode_value(record)?;
        self.writer.write_all(&frame_record(&payload)?)?;
        Ok(())
    }

    fn sync(&mut self) -> SmResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read every intact record, cutting off a torn tail.
    fn replay(path: &Path) -> SmResult<Vec<WalRecord>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        let mut input = BufReader::new(file);
        let mut records = Vec::new();
        let mut good_len = 0u64;
        while let Some(payload) = next_record(&mut input)? {
            good_len += (RECORD_HEADER_SIZE + payload.len()) as u64;
            records.push(decode_value::<WalRecord>(&payload)?);
        }
        if good_len < file_len {
            warn!(
                path = %path.display(),
                good_len,
                file_len,
                "truncating torn wal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
        }
        Ok(records)
    }
}

#[derive(Default)]
struct DiskState {
    map: Arc<KvMap>,
    applied: u64,
    current: Option<CurrentRecord>,
    wal: Option<Wal>,
}

/// Key/value store with the self-managed storage contract.
///
/// Updates are logged to a WAL before they become visible and reach disk
/// on `sync`. `open` rebuilds the map from the current checkpoint and WAL.
pub struct DiskKv {
    dir: PathBuf,
    state: RwLock<DiskState>,
}

impl DiskKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: RwLock::new(DiskState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Remove checkpoints other than the live one and `keep`.
    fn prune_checkpoints(&self, live: Option<&str>, keep: &str) -> SmResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("checkpoint-") || !name.ends_with(".ckpt") {
                continue;
            }
            if name == keep || Some(name) == live {
                continue;
            }
            debug!(checkpoint = name, "removing stale checkpoint");
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }
}

#[async_trait]
impl StateMachine for DiskKv {
    fn kind(&self) -> MachineKind {
        MachineKind::SelfManaged
    }

    async fn open(&self, cancel: &CancelSignal) -> SmResult<u64> {
        let mut state = self.state.write().await;
        if state.wal.is_some() {
            return Ok(state.applied);
        }
        fs::create_dir_all(&self.dir)?;
        remove_temp_files(&self.dir)?;

        let current = read_current(&self.dir)?.unwrap_or_else(CurrentRecord::initial);
        let (mut map, mut applied) = match &current.checkpoint {
            Some(name) => {
                let checkpoint = read_checkpoint(&self.dir.join(name))?;
                (checkpoint.map, checkpoint.index)
            }
            None => (KvMap::new(), 0),
        };

        let wal_path = self.dir.join(&current.wal);
        let mut replayed = 0u64;
        for (i, record) in Wal::replay(&wal_path)?.into_iter().enumerate() {
            if i % REPLAY_CANCEL_INTERVAL == 0 {
                cancel.check()?;
            }
            if record.index <= applied {
                continue;
            }
            if record.index != applied + 1 {
                return Err(SmError::Corrupted(format!(
                    "wal jumps from index {applied} to {}",
                    record.index
                )));
            }
            apply_cmd(&mut map, &record.cmd);
            applied = record.index;
            replayed += 1;
        }

        state.wal = Some(Wal::open(&wal_path)?);
        state.map = Arc::new(map);
        state.applied = applied;
        state.current = Some(current);
        info!(
            dir = %self.dir.display(),
            index = applied,
            replayed,
            "opened disk key/value store"
        );
        Ok(applied)
    }

    async fn update(&self, entries: &[Entry]) -> SmResult<Vec<EntryResult>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let wal = state.wal.as_mut().ok_or(SmError::NotOpened)?;
        let map = Arc::make_mut(&mut state.map);
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            wal.append(&WalRecord {
                index: entry.index,
                cmd: entry.cmd.clone(),
            })?;
            results.push(apply_cmd(map, &entry.cmd));
            state.applied = entry.index;
        }
        Ok(results)
    }

    async fn lookup(&self, query: &[u8]) -> SmResult<LookupResult> {
        let map = self.state.read().await.map.clone();
        lookup(&map, query)
    }

    async fn hash(&self) -> SmResult<u64> {
        let map = self.state.read().await.map.clone();
        Ok(state_hash(&map))
    }

    async fn prepare_snapshot(&self) -> SmResult<SnapshotState> {
        let state = self.state.read().await;
        Ok(Box::new(DiskView {
            index: state.applied,
            map: state.map.clone(),
        }))
    }

    async fn save_snapshot(
        &self,
        view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
        files: &mut FileManifest,
    ) -> SmResult<()> {
        let view: &DiskView = view_as(view)?;
        writer.cancel_signal().check()?;

        let name = checkpoint_name(view.index);
        let path = self.dir.join(&name);
        if !path.exists() {
            write_checkpoint(&self.dir, &path, view.index, &view.map)?;
            debug!(index = view.index, keys = view.map.len(), "wrote checkpoint");
        }
        let live = self
            .state
            .read()
            .await
            .current
            .as_ref()
            .and_then(|c| c.checkpoint.clone());
        self.prune_checkpoints(live.as_deref(), &name)?;

        files.add_file(CHECKPOINT_FILE_ID, &path, view.index.to_le_bytes().to_vec())?;
        writer
            .write_value(&SnapshotDescriptor {
                index: view.index,
                keys: view.map.len() as u64,
                file_id: CHECKPOINT_FILE_ID,
            })
            .await
    }

    async fn recover_from_snapshot(
        &self,
        reader: &mut SnapshotReader,
        files: &FileManifest,
    ) -> SmResult<()> {
        let descriptor: SnapshotDescriptor = reader.read_value().await?;
        reader.finish().await?;

        let file = files.get(descriptor.file_id).ok_or_else(|| {
            SmError::Snapshot(format!(
                "manifest lacks checkpoint file {}",
                descriptor.file_id
            ))
        })?;
        let checkpoint = read_checkpoint(&file.path)?;
        if checkpoint.index != descriptor.index || checkpoint.map.len() as u64 != descriptor.keys {
            return Err(SmError::Corrupted(format!(
                "checkpoint holds {} keys at index {}, snapshot expects {} at {}",
                checkpoint.map.len(),
                checkpoint.index,
                descriptor.keys,
                descriptor.index
            )));
        }
        reader.cancel_signal().check()?;

        let mut state = self.state.write().await;
        fs::create_dir_all(&self.dir)?;
        let name = checkpoint_name(descriptor.index);
        let target = self.dir.join(&name);
        if file.path != target {
            let contents = fs::read(&file.path)?;
            write_atomically(&self.dir, &target, &contents)?;
        }

        let previous = state.current.clone();
        let generation = previous.as_ref().map_or(0, |c| c.generation) + 1;
        let next = CurrentRecord {
            generation,
            checkpoint: Some(name),
            wal: wal_name(generation),
        };
        let wal = Wal::create(&self.dir, &self.dir.join(&next.wal))?;
        write_current(&self.dir, &next)?;

        // The new generation is live; nothing below may fail the recovery.
        if let Some(previous) = previous {
            if previous.wal != next.wal {
                if let Err(e) = fs::remove_file(self.dir.join(&previous.wal)) {
                    warn!(wal = previous.wal, error = %e, "failed to remove replaced wal");
                }
            }
        }
        state.wal = Some(wal);
        state.map = Arc::new(checkpoint.map);
        state.applied = descriptor.index;
        state.current = Some(next);
        info!(
            dir = %self.dir.display(),
            index = descriptor.index,
            generation,
            "switched to recovered checkpoint"
        );
        Ok(())
    }

    async fn sync(&self) -> SmResult<()> {
        let mut state = self.state.write().await;
        state.wal.as_mut().ok_or(SmError::NotOpened)?.sync()
    }

    async fn close(&self) -> SmResult<()> {
        let mut state = self.state.write().await;
        if let Some(mut wal) = state.wal.take() {
            wal.sync()?;
            debug!(wal = %wal.path.display(), "closed wal");
        }
        Ok(())
    }
}
