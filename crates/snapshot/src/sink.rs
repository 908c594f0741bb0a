//! Where snapshot frames go, and where they come from.
//!
//! Sinks receive already-encoded frames; sources hand back complete frames
//! for the reader to verify. The bounded channel pair bounds the memory of a
//! streamed transfer to `capacity` frames.

use crate::frame::{FrameHeader, FRAME_HEADER_SIZE};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use common::{SmError, SmResult};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::debug;

/// Destination of a write session.
#[async_trait]
pub trait ChunkSink: Send {
    /// Deliver one encoded frame.
    async fn send(&mut self, frame: Bytes) -> SmResult<()>;

    /// Make everything sent so far durable/visible. Called after the end frame.
    async fn commit(&mut self) -> SmResult<()>;

    /// Discard everything sent so far.
    async fn abort(&mut self);
}

/// Origin of a read session.
#[async_trait]
pub trait ChunkSource: Send {
    /// Next complete frame, or `None` when the underlying stream is exhausted.
    async fn next_frame(&mut self) -> SmResult<Option<Bytes>>;
}

/// Create a bounded in-memory stream holding at most `capacity` frames.
pub fn snapshot_channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

/// Sending half of [`snapshot_channel`].
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> SmResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SmError::Snapshot("stream already closed".into()))?;
        tx.send(frame)
            .await
            .map_err(|_| SmError::Snapshot("snapshot receiver went away".into()))
    }

    async fn commit(&mut self) -> SmResult<()> {
        self.tx = None;
        Ok(())
    }

    async fn abort(&mut self) {
        // Closing without an end frame makes the reader see a truncated stream.
        self.tx = None;
    }
}

/// Receiving half of [`snapshot_channel`].
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl ChunkSource for ChannelSource {
    async fn next_frame(&mut self) -> SmResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Writes frames to `{path}.tmp`, renamed onto `path` only on commit.
pub struct FileSink {
    path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    committed: bool,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> SmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let temp_path = temp_path_for(&path);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            path,
            temp_path,
            writer: Some(BufWriter::new(file)),
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn send(&mut self, frame: Bytes) -> SmResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SmError::Snapshot("snapshot file already closed".into()))?;
        writer.write_all(&frame).await?;
        Ok(())
    }

    async fn commit(&mut self) -> SmResult<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| SmError::Snapshot("snapshot file already closed".into()))?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        // Atomic rename
        fs::rename(&self.temp_path, &self.path).await?;

        // Fsync directory
        if let Some(dir) = self.path.parent() {
            if let Ok(dir) = File::open(dir).await {
                dir.sync_all().await?;
            }
        }
        self.committed = true;
        debug!(path = %self.path.display(), "snapshot file committed");
        Ok(())
    }

    async fn abort(&mut self) {
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.temp_path.display(), error = %e, "failed to remove partial snapshot");
            }
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.committed {
            self.writer = None;
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Reads frames back from a file written by [`FileSink`].
pub struct FileSource {
    reader: BufReader<File>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> SmResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SmError::MissingFile(path.to_path_buf())
            } else {
                SmError::Io(e)
            }
        })?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    async fn next_frame(&mut self) -> SmResult<Option<Bytes>> {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match self.reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(SmError::Io(e)),
        }

        let header = FrameHeader::from_bytes(&header_buf);
        header.validate()?;

        let mut payload = vec![0u8; header.length as usize];
        self.reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                SmError::Corrupted("snapshot file ends inside a frame".into())
            } else {
                SmError::Io(e)
            }
        })?;

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_slice(&header_buf);
        frame.put_slice(&payload);
        Ok(Some(frame.freeze()))
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
