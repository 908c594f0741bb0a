//! Named state machine factories and the set of hosts on a node.

use crate::host::Host;
use crate::machine::StateMachine;
use common::{HostConfig, ReplicaId, SmError, SmResult};
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Builds a state machine for one replica.
pub type MachineFactory = Arc<dyn Fn(ReplicaId) -> Box<dyn StateMachine> + Send + Sync>;

/// State machine implementations available to a node, by name.
///
/// Registration happens at startup; there is no dynamic loading.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, MachineFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ReplicaId) -> Box<dyn StateMachine> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn get(&self, name: &str) -> Option<MachineFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn build(&self, name: &str, replica: ReplicaId) -> SmResult<Box<dyn StateMachine>> {
        let factory = self
            .get(name)
            .ok_or_else(|| SmError::Machine(format!("no state machine registered as {name:?}")))?;
        Ok(factory(replica))
    }
}

/// One host per replica, created from registered factories.
pub struct Hosts {
    registry: FactoryRegistry,
    config: HostConfig,
    hosts: RwLock<HashMap<ReplicaId, Arc<Host>>>,
}

impl Hosts {
    pub fn new(registry: FactoryRegistry, config: HostConfig) -> Self {
        Self {
            registry,
            config,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    /// Create a host using the configured `state_machine` factory.
    pub async fn create(&self, replica: ReplicaId) -> SmResult<Arc<Host>> {
        let name = self.config.state_machine.clone();
        self.create_with(replica, &name).await
    }

    /// Create a host with the factory registered as `name`.
    pub async fn create_with(&self, replica: ReplicaId, name: &str) -> SmResult<Arc<Host>> {
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(&replica) {
            return Err(SmError::Machine(format!("replica {replica} already exists")));
        }
        let machine = self.registry.build(name, replica)?;
        let host = Arc::new(Host::create(replica, self.config.clone(), machine)?);
        hosts.insert(replica, host.clone());
        info!(
            group = replica.group.0,
            member = replica.member.0,
            state_machine = name,
            "registered replica"
        );
        Ok(host)
    }

    pub async fn get(&self, replica: ReplicaId) -> Option<Arc<Host>> {
        self.hosts.read().await.get(&replica).cloned()
    }

    /// Remove and close the replica's host.
    pub async fn destroy(&self, replica: ReplicaId) -> SmResult<()> {
        let host = self
            .hosts
            .write()
            .await
            .remove(&replica)
            .ok_or_else(|| SmError::Machine(format!("replica {replica} does not exist")))?;
        host.close().await
    }

    /// Replicas currently hosted, sorted.
    pub async fn replicas(&self) -> Vec<ReplicaId> {
        let mut replicas: Vec<ReplicaId> = self.hosts.read().await.keys().copied().collect();
        replicas.sort();
        replicas
    }

    pub async fn len(&self) -> usize {
        self.hosts.read().await.len()
    }

    /// Close every host.
    pub async fn shutdown(&self) -> SmResult<()> {
        let drained: Vec<Arc<Host>> = self.hosts.write().await.drain().map(|(_, h)| h).collect();
        let mut first_err = None;
        for host in drained {
            if let Err(e) = host.close().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
