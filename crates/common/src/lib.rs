
pub mod logging;

pub use logging::init_tracing;

use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Identifier of a replicated group.
/// Examples:
/// - `let accounts = GroupId(1);`
/// - `let sessions = GroupId(42);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

/// Identifier of one replica (member) inside a group.
/// Examples:
/// - `let first = MemberId(1);`
/// - `let learner = MemberId(7);`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u64);

/// The (group, member) pair a state machine instance belongs to.
///
/// Immutable for the lifetime of the instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    pub group: GroupId,
    pub member: MemberId,
}

impl ReplicaId {
    pub fn new(group: u64, member: u64) -> Self {
        Self {
            group: GroupId(group),
            member: MemberId(member),
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:05}:{:05}]", self.group.0, self.member.0)
    }
}

/// Client id used by entries that are not managed by a client session.
pub const NOT_SESSION_MANAGED_CLIENT_ID: u64 = 0;

/// A committed log entry handed to the state machine.
///
/// `client_id`, `series_id` and `responded_to` carry client session
/// information; entries produced outside a session leave them at zero.
/// Examples:
/// - `let e = Entry::new(1, b"x=1".to_vec());`
/// - `let e = Entry::new(5, b"y=2".to_vec()).with_session(99, 3, 2);`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub index: u64,
    pub client_id: u64,
    pub series_id: u64,
    pub responded_to: u64,
    pub cmd: Vec<u8>,
}

impl Entry {
    pub fn new(index: u64, cmd: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, client_id: u64, series_id: u64, responded_to: u64) -> Self {
        self.client_id = client_id;
        self.series_id = series_id;
        self.responded_to = responded_to;
        self
    }

    /// True when the entry carries no client session information.
    pub fn is_session_free(&self) -> bool {
        self.client_id == NOT_SESSION_MANAGED_CLIENT_ID
    }
}

/// Result of applying one entry, returned to the proposing client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryResult {
    pub value: u64,
    pub data: Vec<u8>,
}

impl EntryResult {
    pub fn new(value: u64) -> Self {
        Self {
            value,
            data: Vec::new(),
        }
    }

    pub fn with_data(value: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            value,
            data: data.into(),
        }
    }
}

/// Canonical error type shared across the state machine subsystems.
#[derive(Error, Debug)]
pub enum SmError {
    #[error("ordering violation: expected index {expected}, got {got}")]
    OrderingViolation { expected: u64, got: u64 },
    #[error("sync failed: {0}")]
    SyncFailed(String),
    #[error("instance halted: {0}")]
    Halted(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("corrupted snapshot stream: {0}")]
    Corrupted(String),
    #[error("snapshot file missing: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("query: {0}")]
    Query(String),
    #[error("unsupported by this state machine: {0}")]
    Unsupported(&'static str),
    #[error("a snapshot context is already outstanding")]
    SnapshotInProgress,
    #[error("state machine not opened")]
    NotOpened,
    #[error("snapshot belongs to group {got}, instance is in group {expected}")]
    GroupMismatch { expected: u64, got: u64 },
    #[error("client session: {0}")]
    Session(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("state machine: {0}")]
    Machine(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SmError {
    /// Fatal errors stop the instance from serving any further requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmError::OrderingViolation { .. } | SmError::SyncFailed(_) | SmError::Halted(_)
        )
    }
}

/// Result alias that carries an `SmError`.
pub type SmResult<T> = Result<T, SmError>;

/// Runtime configuration for a state machine host.
///
/// # Example
/// ```
/// use common::HostConfig;
/// use std::path::PathBuf;
///
/// let config = HostConfig::builder()
///     .snapshot_dir(PathBuf::from("./snapshots"))
///     .snapshot_chunk_size(4096)
///     .state_machine("mem-kv".to_string())
///     .build();
/// assert_eq!(config.stream_capacity, 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(default)]
pub struct HostConfig {
    /// Byte size of one snapshot stream chunk; cancellation is checked per chunk.
    #[builder(default = 64 * 1024)]
    pub snapshot_chunk_size: usize,
    /// Number of chunks an in-memory snapshot stream buffers before blocking.
    #[builder(default = 16)]
    pub stream_capacity: usize,
    /// Upper bound on tracked client sessions.
    #[builder(default = 4096)]
    pub max_client_sessions: usize,
    /// Directory used by the snapshot store.
    #[builder(default = PathBuf::from("./snapshots"))]
    pub snapshot_dir: PathBuf,
    /// Number of snapshots retained by the snapshot store.
    #[builder(default = 3)]
    pub keep_snapshots: usize,
    /// Registered factory name used to create state machines.
    #[builder(default = "mem-kv".to_string())]
    pub state_machine: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            snapshot_chunk_size: 64 * 1024,
            stream_capacity: 16,
            max_client_sessions: 4096,
            snapshot_dir: PathBuf::from("./snapshots"),
            keep_snapshots: 3,
            state_machine: "mem-kv".to_string(),
        }
    }
}

impl HostConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> SmResult<Self> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| SmError::Codec(e.to_string()))
    }

    /// Reject configurations no host can run with.
    pub fn validate(&self) -> SmResult<()> {
        if self.snapshot_chunk_size == 0 {
            return Err(SmError::Snapshot("snapshot_chunk_size must be > 0".into()));
        }
        if self.stream_capacity == 0 {
            return Err(SmError::Snapshot("stream_capacity must be > 0".into()));
        }
        if self.max_client_sessions == 0 {
            return Err(SmError::Session("max_client_sessions must be > 0".into()));
        }
        Ok(())
    }
}
