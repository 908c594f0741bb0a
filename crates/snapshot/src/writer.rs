//! Write side of a snapshot session.

use crate::cancel::CancelSignal;
use crate::codec::{encode_value, MAX_VALUE_LEN};
use crate::frame::{encode_frame, EndMarker, FrameKind};
use crate::sink::ChunkSink;
use bytes::{Bytes, BytesMut};
use common::{SmError, SmResult};
use serde::Serialize;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Open,
    Finished,
    Aborted,
}

/// Buffers written bytes into fixed-size chunks and streams them to a sink.
///
/// Any error, including cancellation, aborts the sink: a reader on the other
/// side never sees a complete stream.
pub struct SnapshotWriter {
    sink: Box<dyn ChunkSink>,
    cancel: CancelSignal,
    chunk_size: usize,
    buf: BytesMut,
    total: u64,
    hasher: crc32fast::Hasher,
    state: WriterState,
}

impl SnapshotWriter {
    pub fn new(sink: impl ChunkSink + 'static, cancel: CancelSignal, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            sink: Box::new(sink),
            cancel,
            chunk_size,
            buf: BytesMut::with_capacity(chunk_size),
            total: 0,
            hasher: crc32fast::Hasher::new(),
            state: WriterState::Open,
        }
    }

    /// Append bytes; full chunks are sent as they fill up.
    pub async fn write(&mut self, data: &[u8]) -> SmResult<()> {
        self.ensure_open()?;
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.chunk_size {
                let chunk = self.buf.split().freeze();
                self.emit(chunk).await?;
            }
        }
        Ok(())
    }

    /// Append a length-prefixed bincode value.
    pub async fn write_value<T: Serialize>(&mut self, value: &T) -> SmResult<()> {
        let bytes = encode_value(value)?;
        if bytes.len() > MAX_VALUE_LEN {
            return Err(SmError::Codec(format!(
                "value of {} bytes exceeds {MAX_VALUE_LEN}",
                bytes.len()
            )));
        }
        let len = bytes.len() as u32;
        self.write(&len.to_le_bytes()).await?;
        self.write(&bytes).await
    }

    /// Flush the tail chunk, send the end frame and commit the sink.
    ///
    /// Returns the number of data bytes in the stream.
    pub async fn finish(&mut self) -> SmResult<u64> {
        self.ensure_open()?;
        if !self.buf.is_empty() {
            let chunk = self.buf.split().freeze();
            self.emit(chunk).await?;
        }
        let marker = EndMarker {
            total_len: self.total,
            checksum: self.hasher.clone().finalize(),
        };
        let frame = encode_frame(FrameKind::End, &marker.to_bytes());
        self.send(frame).await?;
        if let Err(e) = self.sink.commit().await {
            self.abort().await;
            return Err(e);
        }
        self.state = WriterState::Finished;
        debug!(bytes = self.total, "snapshot stream finished");
        Ok(self.total)
    }

    /// Discard the stream. Idempotent; a finished stream stays finished.
    pub async fn abort(&mut self) {
        if self.state == WriterState::Open {
            self.state = WriterState::Aborted;
            self.buf.clear();
            self.sink.abort().await;
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.total + self.buf.len() as u64
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.state == WriterState::Finished
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    fn ensure_open(&self) -> SmResult<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Finished => Err(SmError::Snapshot("snapshot stream already finished".into())),
            WriterState::Aborted => Err(SmError::Snapshot("snapshot stream was aborted".into())),
        }
    }

    async fn emit(&mut self, chunk: Bytes) -> SmResult<()> {
        self.hasher.update(&chunk);
        self.total += chunk.len() as u64;
        let frame = encode_frame(FrameKind::Data, &chunk);
        self.send(frame).await
    }

    async fn send(&mut self, frame: Bytes) -> SmResult<()> {
        let result = match self.cancel.check() {
            Err(e) => Err(e),
            Ok(()) => {
                let cancel = &self.cancel;
                let sink = &mut self.sink;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SmError::Cancelled),
                    sent = sink.send(frame) => sent,
                }
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "aborting snapshot stream");
            self.abort().await;
            return Err(e);
        }
        Ok(())
    }
}
