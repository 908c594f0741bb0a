//! Command-line driver for the replicated state machine hosts.
//!
//! Applies command files to a key/value machine, keeps snapshots in a
//! snapshot store and restores them into fresh instances.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{Entry, HostConfig, ReplicaId};
use rsm::{Host, Hosts};
use snapshot::{CancelSignal, SnapshotStore, StoredSnapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_DATA_DIR: &str = "./rsm_data";
const DEFAULT_GROUP: u64 = 1;

#[derive(Parser, Debug)]
#[command(name = "rsmctl", about = "Drive key/value state machines and their snapshots")]
struct Args {
    /// JSON host configuration; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root directory for self-managed replicas
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// State machine to run, overriding the configuration
    #[arg(long)]
    machine: Option<String>,

    /// Replica group
    #[arg(long, default_value_t = DEFAULT_GROUP)]
    group: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a file of commands, one per line, then take a snapshot
    Apply {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        member: u64,
        /// Skip the snapshot after applying
        #[arg(long)]
        no_snapshot: bool,
    },
    /// Recover the latest snapshot into a fresh instance
    Restore {
        #[arg(long, default_value_t = 2)]
        member: u64,
    },
    /// Print the applied index and state hash
    Status {
        #[arg(long, default_value_t = 1)]
        member: u64,
    },
    /// Look up a key
    Get {
        key: String,
        #[arg(long, default_value_t = 1)]
        member: u64,
    },
    /// List stored snapshots
    Snapshots,
}

#[tokio::main]
async fn main() -> Result<()> {
    common::init_tracing("warn");
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => HostConfig::default(),
    };
    if let Some(machine) = &args.machine {
        config.state_machine = machine.clone();
    }
    config.validate()?;

    let node = Node::open(&args.data_dir, args.group, config)?;
    let output = node.run(args.command).await;
    node.hosts.shutdown().await?;
    print!("{}", output?);
    Ok(())
}

/// Hosts and a snapshot store sharing one configuration.
struct Node {
    group: u64,
    hosts: Hosts,
    store: SnapshotStore,
}

impl Node {
    fn open(data_dir: &Path, group: u64, config: HostConfig) -> Result<Self> {
        let registry = kv::registry(data_dir.join("replicas"));
        if !registry.contains(&config.state_machine) {
            bail!(
                "unknown state machine {:?}; known: {}",
                config.state_machine,
                registry.names().join(", ")
            );
        }
        let store = SnapshotStore::open(&config.snapshot_dir, config.keep_snapshots)
            .with_context(|| format!("failed to open {}", config.snapshot_dir.display()))?;
        Ok(Self {
            group,
            hosts: Hosts::new(registry, config),
            store,
        })
    }

    async fn run(&self, command: Command) -> Result<String> {
        match command {
            Command::Apply {
                file,
                member,
                no_snapshot,
            } => {
                let contents = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                self.apply(member, &read_commands(&contents), !no_snapshot)
                    .await
            }
            Command::Restore { member } => self.restore(member).await,
            Command::Status { member } => {
                let host = self.load(member).await?;
                status(&host).await
            }
            Command::Get { key, member } => {
                let host = self.load(member).await?;
                let value = host.lookup(key.as_bytes()).await?;
                Ok(format!("{key} = {}\n", String::from_utf8_lossy(value.as_bytes())))
            }
            Command::Snapshots => self.list(),
        }
    }

    /// Create the replica and bring it up to date.
    ///
    /// Self-managed machines resume from their own storage; the others start
    /// from the latest stored snapshot, if any.
    async fn load(&self, member: u64) -> Result<Arc<Host>> {
        let host = self.hosts.create(ReplicaId::new(self.group, member)).await?;
        if host.kind().manages_own_storage() {
            host.open(&CancelSignal::never()).await?;
        } else if let Some(latest) = self.store.latest()? {
            host.recover_from_store(&self.store, &latest, CancelSignal::never())
                .await
                .with_context(|| format!("failed to recover snapshot {}", latest.seq))?;
        }
        Ok(host)
    }

    async fn apply(&self, member: u64, commands: &[&str], snapshot: bool) -> Result<String> {
        let host = self.load(member).await?;
        let first = host.applied_index() + 1;
        let entries: Vec<Entry> = commands
            .iter()
            .enumerate()
            .map(|(i, cmd)| Entry::new(first + i as u64, *cmd))
            .collect();
        let result = host.apply(&entries).await?;
        let mut output = format!(
            "applied {} through {}\n",
            entries.len(),
            result.applied_index
        );
        if host.kind().manages_own_storage() {
            output.push_str(&format!("synced {}\n", host.sync().await?));
        }
        if snapshot {
            let stored = host
                .snapshot_to_store(&self.store, CancelSignal::never())
                .await?;
            info!(seq = stored.seq, index = stored.index, "stored snapshot");
            output.push_str(&format!(
                "snapshot {} at index {}\n",
                stored.seq, stored.index
            ));
        }
        Ok(output)
    }

    async fn restore(&self, member: u64) -> Result<String> {
        let Some(latest) = self.store.latest()? else {
            bail!("no snapshots in {}", self.store.dir().display());
        };
        let host = self.hosts.create(ReplicaId::new(self.group, member)).await?;
        if host.kind().manages_own_storage() {
            host.open(&CancelSignal::never()).await?;
        }
        host.recover_from_store(&self.store, &latest, CancelSignal::never())
            .await?;
        let mut output = format!("restored snapshot {}\n", latest.seq);
        output.push_str(&status(&host).await?);
        Ok(output)
    }

    fn list(&self) -> Result<String> {
        let snapshots = self.store.list()?;
        if snapshots.is_empty() {
            return Ok("No snapshots found.\n".into());
        }
        Ok(snapshots.iter().map(describe).collect())
    }
}

async fn status(host: &Host) -> Result<String> {
    Ok(format!(
        "index {}\nhash {:016x}\n",
        host.applied_index(),
        host.hash().await?
    ))
}

fn describe(snapshot: &StoredSnapshot) -> String {
    format!(
        "{:>6}  index {:<10} {:>10} bytes  {} files\n",
        snapshot.seq,
        snapshot.index,
        snapshot.bytes,
        snapshot.manifest.len()
    )
}

/// Non-empty lines that are not `#` comments.
fn read_commands(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}
