//! Commands and state shared by every key/value machine.
//!
//! Commands are UTF-8 text:
//! - `key=value` sets `key`
//! - `-key` deletes `key`
//!
//! Anything else is applied as a no-op with result value 0, so a malformed
//! proposal cannot make replicas diverge.

use common::{EntryResult, SmError, SmResult};
use rsm::LookupResult;
use snapshot::{SnapshotReader, SnapshotWriter};
use std::collections::BTreeMap;

/// Ordered so that hashing and serialization are deterministic.
pub type KvMap = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        if let Some(key) = text.strip_prefix('-') {
            return (!key.is_empty()).then(|| Command::delete(key));
        }
        let (key, value) = text.split_once('=')?;
        (!key.is_empty()).then(|| Command::set(key, value))
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Set { key, value } => format!("{key}={value}").into_bytes(),
            Command::Delete { key } => format!("-{key}").into_bytes(),
        }
    }

    /// Result value is 1 when the command changed the map.
    pub fn apply(self, map: &mut KvMap) -> EntryResult {
        let changed = match self {
            Command::Set { key, value } => map.insert(key, value.clone()).as_ref() != Some(&value),
            Command::Delete { key } => map.remove(&key).is_some(),
        };
        EntryResult::new(u64::from(changed))
    }
}

/// Apply raw command bytes.
pub fn apply_cmd(map: &mut KvMap, cmd: &[u8]) -> EntryResult {
    match Command::parse(cmd) {
        Some(command) => command.apply(map),
        None => EntryResult::new(0),
    }
}

/// BLAKE3 over every pair in key order, each field prefixed with its
/// length as a little-endian u64; the first eight digest bytes, read
/// little-endian, are the hash. Stable across builds and platforms.
pub fn state_hash(map: &KvMap) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in map {
        for field in [key.as_bytes(), value.as_bytes()] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// A query is a key; the answer is its value.
pub fn lookup(map: &KvMap, query: &[u8]) -> SmResult<LookupResult> {
    let key = std::str::from_utf8(query)
        .map_err(|_| SmError::Query("key is not valid UTF-8".into()))?;
    map.get(key)
        .map(|value| LookupResult::new(value.as_bytes()))
        .ok_or_else(|| SmError::Query(format!("key {key:?} not found")))
}

/// Stream a map as a count followed by one value per pair.
pub async fn write_map(writer: &mut SnapshotWriter, map: &KvMap) -> SmResult<()> {
    writer.write_value(&(map.len() as u64)).await?;
    for pair in map {
        writer.write_value(&pair).await?;
    }
    Ok(())
}

pub async fn read_map(reader: &mut SnapshotReader) -> SmResult<KvMap> {
    let count: u64 = reader.read_value().await?;
    let mut map = KvMap::new();
    for _ in 0..count {
        let (key, value): (String, String) = reader.read_value().await?;
        map.insert(key, value);
    }
    if map.len() as u64 != count {
        return Err(SmError::Corrupted("duplicate keys in snapshot".into()));
    }
    Ok(map)
}
