//! Key/value state machines, one per host kind.
//!
//! | Machine       | Kind          | State                                |
//! |---------------|---------------|--------------------------------------|
//! | [`MemKv`]       | Sequential    | `BTreeMap` behind a lock             |
//! | [`VersionedKv`] | Concurrent    | copy-on-write `Arc<BTreeMap>`        |
//! | [`DiskKv`]      | SelfManaged   | checkpoint file plus write-ahead log |
//!
//! All three accept the same commands (see [`state`]) and hash equal for
//! equal contents, so replicas of different kinds can be compared directly.


pub mod disk;
pub mod mem;
pub mod state;
pub mod versioned;

pub use disk::DiskKv;
pub use mem::MemKv;
pub use state::{Command, KvMap};
pub use versioned::VersionedKv;

use common::ReplicaId;
use rsm::{FactoryRegistry, StateMachine};
use std::path::{Path, PathBuf};

pub const MEM_KV: &str = "mem-kv";
pub const VERSIONED_KV: &str = "versioned-kv";
pub const DISK_KV: &str = "disk-kv";

/// Storage directory of one replica's `DiskKv` under `root`.
pub fn replica_dir(root: &Path, replica: ReplicaId) -> PathBuf {
    root.join(format!("group-{:05}", replica.group.0))
        .join(format!("member-{:05}", replica.member.0))
}

/// Register every machine in this crate. `DiskKv` replicas live under `data_root`.
pub fn register_all(registry: &mut FactoryRegistry, data_root: impl Into<PathBuf>) {
    let root = data_root.into();
    registry.register(MEM_KV, |_| -> Box<dyn StateMachine> { Box::new(MemKv::new()) });
    registry.register(VERSIONED_KV, |_| -> Box<dyn StateMachine> {
        Box::new(VersionedKv::new())
    });
    registry.register(DISK_KV, move |replica| -> Box<dyn StateMachine> {
        Box::new(DiskKv::new(replica_dir(&root, replica)))
    });
}

/// A registry holding every machine in this crate.
pub fn registry(data_root: impl Into<PathBuf>) -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    register_all(&mut registry, data_root);
    registry
}
