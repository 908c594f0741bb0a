use crate::state::{apply_cmd, lookup, read_map, state_hash, write_map, KvMap};
use async_trait::async_trait;
use common::{Entry, EntryResult, SmResult};
use rsm::{LookupResult, MachineKind, StateMachine};
use snapshot::{FileManifest, SnapshotReader, SnapshotWriter};
use std::any::Any;
use tokio::sync::RwLock;

/// In-memory key/value store with the sequential contract.
///
/// The host never overlaps calls, so saves serialize the live map.
#[derive(Default)]
pub struct MemKv {
    map: RwLock<KvMap>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateMachine for MemKv {
    fn kind(&self) -> MachineKind {
        MachineKind::Sequential
    }

    async fn update(&self, entries: &[Entry]) -> SmResult<Vec<EntryResult>> {
        let mut map = self.map.write().await;
        Ok(entries.iter().map(|e| apply_cmd(&mut map, &e.cmd)).collect())
    }

    async fn lookup(&self, query: &[u8]) -> SmResult<LookupResult> {
        lookup(&*self.map.read().await, query)
    }

    async fn hash(&self) -> SmResult<u64> {
        Ok(state_hash(&*self.map.read().await))
    }

    async fn save_snapshot(
        &self,
        _view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
        _files: &mut FileManifest,
    ) -> SmResult<()> {
        let map = self.map.read().await;
        write_map(writer, &map).await
    }

    async fn recover_from_snapshot(
        &self,
        reader: &mut SnapshotReader,
        _files: &FileManifest,
    ) -> SmResult<()> {
        let restored = read_map(reader).await?;
        reader.finish().await?;
        *self.map.write().await = restored;
        Ok(())
    }
}
