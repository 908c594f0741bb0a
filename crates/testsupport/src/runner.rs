//! Snapshot transfers and command scripts.

use async_trait::async_trait;
use bytes::Bytes;
use common::{SmError, SmResult};
use rsm::{Host, SnapshotContext};
use snapshot::{
    cancel_pair, snapshot_channel, CancelSignal, ChannelSource, ChunkSource, FileManifest,
    SnapshotReader, SnapshotStore, SnapshotWriter,
};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::future::Future;
use tokio::sync::oneshot;

/// Run `future` to completion on a fresh current-thread runtime.
///
/// For property tests, whose bodies are synchronous.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build test runtime")
        .block_on(future)
}

/// Stream a snapshot from `source` straight into `target`.
pub async fn transfer(
    source: &Host,
    context: Option<SnapshotContext>,
    target: &Host,
) -> SmResult<u64> {
    let (_save_handle, save_cancel) = cancel_pair();
    let (_recover_handle, recover_cancel) = cancel_pair();
    transfer_with(source, context, target, save_cancel, recover_cancel).await
}

/// Like [`transfer`], with a cancellation signal for each side.
///
/// Save and recovery run concurrently over a bounded channel sized by the
/// source's configuration. A self-managed target needs the manifest, which
/// is only known once the save finishes; until then the recovering side
/// drains the channel into memory so the save never stalls on it.
pub async fn transfer_with(
    source: &Host,
    context: Option<SnapshotContext>,
    target: &Host,
    save_cancel: CancelSignal,
    recover_cancel: CancelSignal,
) -> SmResult<u64> {
    let config = source.config();
    let (sink, stream) = snapshot_channel(config.stream_capacity);
    let mut writer = SnapshotWriter::new(sink, save_cancel, config.snapshot_chunk_size);
    let (manifest_tx, manifest_rx) = oneshot::channel::<FileManifest>();
    let needs_manifest = target.kind().manages_own_storage();

    let save = async move {
        let saved = source.save_snapshot(context, &mut writer).await;
        if let Ok(saved) = &saved {
            let _ = manifest_tx.send(saved.manifest.clone());
        }
        saved
    };
    // Owning the reader here closes the stream as soon as recovery returns.
    let recover = async move {
        let mut source = HeldFrames::new(stream);
        let manifest = if needs_manifest {
            source.until(manifest_rx).await?
        } else {
            FileManifest::new()
        };
        let mut reader = SnapshotReader::new(source, recover_cancel);
        target.recover_from_snapshot(&mut reader, &manifest).await
    };

    match tokio::join!(save, recover) {
        (Ok(_), Ok(index)) => Ok(index),
        (Err(SmError::Cancelled), _) | (_, Err(SmError::Cancelled)) => Err(SmError::Cancelled),
        (_, Err(e)) | (Err(e), _) => Err(e),
    }
}

/// Frames received before recovery starts, replayed ahead of the rest.
struct HeldFrames {
    held: VecDeque<Bytes>,
    rest: ChannelSource,
}

impl HeldFrames {
    fn new(rest: ChannelSource) -> Self {
        Self {
            held: VecDeque::new(),
            rest,
        }
    }

    /// Hold incoming frames until `manifest` arrives.
    async fn until(
        &mut self,
        mut manifest: oneshot::Receiver<FileManifest>,
    ) -> SmResult<FileManifest> {
        let save_failed = |_| SmError::Snapshot("snapshot save failed".into());
        loop {
            tokio::select! {
                biased;
                received = &mut manifest => return received.map_err(save_failed),
                frame = self.rest.next_frame() => match frame? {
                    Some(frame) => self.held.push_back(frame),
                    None => return manifest.await.map_err(save_failed),
                },
            }
        }
    }
}

#[async_trait]
impl ChunkSource for HeldFrames {
    async fn next_frame(&mut self) -> SmResult<Option<Bytes>> {
        match self.held.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => self.rest.next_frame().await,
        }
    }
}

/// Save `source` into `store`, then recover `target` from that snapshot.
pub async fn transfer_via_store(
    source: &Host,
    target: &Host,
    store: &SnapshotStore,
) -> SmResult<u64> {
    let stored = source
        .snapshot_to_store(store, CancelSignal::never())
        .await?;
    target
        .recover_from_store(store, &stored, CancelSignal::never())
        .await
}

/// Execute a command script against `host` and return its output.
///
/// One step per line; blank lines and `#` comments are skipped:
/// - `get KEY` prints `KEY = VALUE` or `KEY missing`
/// - `hash` prints the state hash
/// - `index` prints the applied index
/// - `sync` syncs a self-managed host
/// - anything else is proposed as the next log entry
///
/// Consecutive proposals are applied as one batch.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
///
/// # async fn example(host: &rsm::Host) {
/// let output = run_script(host, r#"
///     x=1
///     x=2
///     get x
/// "#).await.unwrap();
/// assert!(output.contains("x = 2"));
/// # }
/// ```
pub async fn run_script(host: &Host, script: &str) -> SmResult<String> {
    let mut output = String::new();
    let mut pending: Vec<&str> = Vec::new();

    for line in script.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step = Step::parse(line);
        if let Step::Propose(cmd) = step {
            pending.push(cmd);
            continue;
        }
        flush(host, &mut pending, &mut output).await?;
        match step {
            Step::Get(key) => match host.lookup(key.as_bytes()).await {
                Ok(value) => {
                    let _ = writeln!(output, "{key} = {}", String::from_utf8_lossy(value.as_bytes()));
                }
                Err(SmError::Query(_)) => {
                    let _ = writeln!(output, "{key} missing");
                }
                Err(e) => return Err(e),
            },
            Step::Hash => {
                let _ = writeln!(output, "hash {:016x}", host.hash().await?);
            }
            Step::Index => {
                let _ = writeln!(output, "index {}", host.applied_index());
            }
            Step::Sync => {
                let _ = writeln!(output, "synced {}", host.sync().await?);
            }
            Step::Propose(_) => {}
        }
    }
    flush(host, &mut pending, &mut output).await?;
    Ok(output)
}

enum Step<'a> {
    Get(&'a str),
    Hash,
    Index,
    Sync,
    Propose(&'a str),
}

impl<'a> Step<'a> {
    fn parse(line: &'a str) -> Self {
        match line {
            "hash" => Step::Hash,
            "index" => Step::Index,
            "sync" => Step::Sync,
            _ => match line.strip_prefix("get ") {
                Some(key) => Step::Get(key.trim()),
                None => Step::Propose(line),
            },
        }
    }
}

async fn flush(host: &Host, pending: &mut Vec<&str>, output: &mut String) -> SmResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let first = host.applied_index() + 1;
    let batch = crate::fixtures::kv_entries(first, pending);
    let result = host.apply(&batch).await?;
    let _ = writeln!(
        output,
        "applied {} through {}",
        pending.len(),
        result.applied_index
    );
    pending.clear();
    Ok(())
}
