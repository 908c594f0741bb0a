//! Common test fixtures and data generators.

use common::{Entry, HostConfig};
use rsm::client_session::{SERIES_ID_FOR_REGISTER, SERIES_ID_FOR_UNREGISTER};

/// Every registered key/value machine.
pub const ALL_MACHINES: [&str; 3] = [kv::MEM_KV, kv::VERSIONED_KV, kv::DISK_KV];

/// Small chunks and a short stream so tests cross many chunk boundaries.
pub fn test_config() -> HostConfig {
    HostConfig::builder()
        .snapshot_chunk_size(16)
        .stream_capacity(2)
        .max_client_sessions(64)
        .build()
}

/// Entries carrying `cmds`, numbered from `first`.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let batch = kv_entries(1, &["x=1", "x=2"]);
/// assert_eq!(batch[1].index, 2);
/// ```
pub fn kv_entries(first: u64, cmds: &[&str]) -> Vec<Entry> {
    cmds.iter()
        .enumerate()
        .map(|(i, cmd)| Entry::new(first + i as u64, cmd.as_bytes()))
        .collect()
}

/// Entries from raw command bytes, numbered from `first`.
pub fn raw_entries(first: u64, cmds: &[Vec<u8>]) -> Vec<Entry> {
    cmds.iter()
        .enumerate()
        .map(|(i, cmd)| Entry::new(first + i as u64, cmd.clone()))
        .collect()
}

/// `count` distinct sets `key{i}=value{i}`, numbered from `first`.
pub fn numbered_sets(first: u64, count: u64) -> Vec<Entry> {
    (0..count)
        .map(|i| Entry::new(first + i, format!("key{i}=value{i}")))
        .collect()
}

/// The two-entry batch `x=1`, `x=2`.
pub fn example_batch() -> Vec<Entry> {
    kv_entries(1, &["x=1", "x=2"])
}

pub fn register_entry(index: u64, client_id: u64) -> Entry {
    Entry::new(index, Vec::new()).with_session(client_id, SERIES_ID_FOR_REGISTER, 0)
}

pub fn unregister_entry(index: u64, client_id: u64) -> Entry {
    Entry::new(index, Vec::new()).with_session(client_id, SERIES_ID_FOR_UNREGISTER, 0)
}

pub fn proposal_entry(
    index: u64,
    client_id: u64,
    series_id: u64,
    responded_to: u64,
    cmd: &str,
) -> Entry {
    Entry::new(index, cmd).with_session(client_id, series_id, responded_to)
}
