//! Isolated test nodes.
//!
//! A [`TestNode`] owns a temporary directory, a [`Hosts`] set with every
//! key/value machine registered, and a snapshot store. Everything is removed
//! when the node is dropped.

use crate::fixtures::test_config;
use common::{HostConfig, ReplicaId, SmResult};
use rsm::{Host, Hosts};
use snapshot::{CancelSignal, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Group used by every replica a test node creates.
pub const TEST_GROUP: u64 = 1;

pub struct TestNode {
    _temp_dir: TempDir,
    data_dir: PathBuf,
    hosts: Hosts,
}

impl TestNode {
    /// A node with the small-chunk test configuration.
    pub fn new() -> SmResult<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: HostConfig) -> SmResult<Self> {
        let temp_dir = tempfile::tempdir()?;
        let data_dir = temp_dir.path().to_path_buf();
        let config = HostConfig {
            snapshot_dir: data_dir.join("snapshots"),
            ..config
        };
        let hosts = Hosts::new(kv::registry(data_dir.join("replicas")), config);
        Ok(Self {
            _temp_dir: temp_dir,
            data_dir,
            hosts,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn hosts(&self) -> &Hosts {
        &self.hosts
    }

    /// Create member `member` of the test group running `machine`.
    ///
    /// Self-managed machines are opened before the host is returned.
    pub async fn host(&self, machine: &str, member: u64) -> SmResult<Arc<Host>> {
        let host = self
            .hosts
            .create_with(ReplicaId::new(TEST_GROUP, member), machine)
            .await?;
        if host.kind().manages_own_storage() {
            host.open(&CancelSignal::never()).await?;
        }
        Ok(host)
    }

    /// Destroy and recreate a member over the same storage.
    pub async fn restart(&self, machine: &str, member: u64) -> SmResult<Arc<Host>> {
        let replica = ReplicaId::new(TEST_GROUP, member);
        if self.hosts.get(replica).await.is_some() {
            self.hosts.destroy(replica).await?;
        }
        self.host(machine, member).await
    }

    /// A snapshot store in the node's snapshot directory.
    pub fn store(&self, keep: usize) -> SmResult<SnapshotStore> {
        SnapshotStore::open(self.data_dir.join("snapshots"), keep)
    }
}
