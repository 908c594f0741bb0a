use crate::state::{apply_cmd, lookup, read_map, state_hash, write_map, KvMap};
use async_trait::async_trait;
use common::{Entry, EntryResult, SmResult};
use rsm::{view_as, LookupResult, MachineKind, SnapshotState, StateMachine};
use snapshot::{FileManifest, SnapshotReader, SnapshotWriter};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Copy-on-write key/value store with the concurrent contract.
///
/// A prepared view is a clone of the `Arc`; the next update that finds the
/// map shared copies it first, so the view never changes.
#[derive(Default)]
pub struct VersionedKv {
    map: RwLock<Arc<KvMap>>,
}

impl VersionedKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateMachine for VersionedKv {
    fn kind(&self) -> MachineKind {
        MachineKind::Concurrent
    }

    async fn update(&self, entries: &[Entry]) -> SmResult<Vec<EntryResult>> {
        let mut current = self.map.write().await;
        if Arc::strong_count(&current) > 1 {
            debug!(keys = current.len(), "copying map shared with a snapshot view");
        }
        let map = Arc::make_mut(&mut current);
        Ok(entries.iter().map(|e| apply_cmd(map, &e.cmd)).collect())
    }

    async fn lookup(&self, query: &[u8]) -> SmResult<LookupResult> {
        let map = self.map.read().await.clone();
        lookup(&map, query)
    }

    async fn hash(&self) -> SmResult<u64> {
        let map = self.map.read().await.clone();
        Ok(state_hash(&map))
    }

    async fn prepare_snapshot(&self) -> SmResult<SnapshotState> {
        Ok(Box::new(self.map.read().await.clone()))
    }

    async fn save_snapshot(
        &self,
        view: Option<&(dyn Any + Send + Sync)>,
        writer: &mut SnapshotWriter,
        _files: &mut FileManifest,
    ) -> SmResult<()> {
        let map: &Arc<KvMap> = view_as(view)?;
        write_map(writer, map).await
    }

    async fn recover_from_snapshot(
        &self,
        reader: &mut SnapshotReader,
        _files: &FileManifest,
    ) -> SmResult<()> {
        let restored = read_map(reader).await?;
        reader.finish().await?;
        *self.map.write().await = Arc::new(restored);
        Ok(())
    }
}
