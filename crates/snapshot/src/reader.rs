//! Read side of a snapshot session.

use crate::cancel::CancelSignal;
use crate::codec::{decode_value, MAX_VALUE_LEN};
use crate::frame::{decode_frame, EndMarker, FrameKind};
use crate::sink::ChunkSource;
use bytes::{Buf, Bytes};
use common::{SmError, SmResult};
use serde::de::DeserializeOwned;

/// Consumes chunks from a source, verifying every frame and the stream totals.
///
/// End of stream is only reported after the end frame has been verified, so
/// a reader that reaches the end has seen exactly what the writer produced.
pub struct SnapshotReader {
    source: Box<dyn ChunkSource>,
    cancel: CancelSignal,
    current: Bytes,
    total: u64,
    hasher: crc32fast::Hasher,
    finished: bool,
}

impl SnapshotReader {
    pub fn new(source: impl ChunkSource + 'static, cancel: CancelSignal) -> Self {
        Self {
            source: Box::new(source),
            cancel,
            current: Bytes::new(),
            total: 0,
            hasher: crc32fast::Hasher::new(),
            finished: false,
        }
    }

    /// Next run of data bytes, or `None` at the verified end of the stream.
    pub async fn read_chunk(&mut self) -> SmResult<Option<Bytes>> {
        if self.current.is_empty() && !self.fill().await? {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.current)))
    }

    /// Fill `buf` completely; a stream ending early is corrupted.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> SmResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.current.is_empty() && !self.fill().await? {
                return Err(SmError::Corrupted(format!(
                    "stream ended after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            let take = self.current.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.current[..take]);
            self.current.advance(take);
            filled += take;
        }
        Ok(())
    }

    /// Read a value written by `SnapshotWriter::write_value`.
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> SmResult<T> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_VALUE_LEN {
            return Err(SmError::Corrupted(format!(
                "value length {len} exceeds {MAX_VALUE_LEN} bytes"
            )));
        }
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes).await?;
        decode_value(&bytes)
    }

    /// Read all remaining data through the verified end of the stream.
    pub async fn read_to_end(&mut self) -> SmResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Verify that the stream ends here. Unread data is an error.
    pub async fn finish(&mut self) -> SmResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.current.is_empty() || self.fill().await? {
            return Err(SmError::Corrupted(format!(
                "{} unread bytes before end of stream",
                self.current.len()
            )));
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Data bytes handed out so far plus those buffered.
    pub fn bytes_read(&self) -> u64 {
        self.total - self.current.len() as u64
    }

    /// Load the next data frame. Returns false once the end frame verified.
    async fn fill(&mut self) -> SmResult<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            self.cancel.check()?;

            let cancel = &self.cancel;
            let source = &mut self.source;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SmError::Cancelled),
                next = source.next_frame() => next?,
            };

            let Some(raw) = next else {
                return Err(SmError::Corrupted(
                    "stream closed before its end frame".into(),
                ));
            };

            let frame = decode_frame(raw)?;
            match frame.kind {
                FrameKind::Data => {
                    if frame.payload.is_empty() {
                        continue;
                    }
                    self.hasher.update(&frame.payload);
                    self.total += frame.payload.len() as u64;
                    self.current = frame.payload;
                    return Ok(true);
                }
                FrameKind::End => {
                    let marker = EndMarker::from_payload(&frame.payload)?;
                    if marker.total_len != self.total {
                        return Err(SmError::Corrupted(format!(
                            "stream carried {} bytes, end frame declares {}",
                            self.total, marker.total_len
                        )));
                    }
                    if marker.checksum != self.hasher.clone().finalize() {
                        return Err(SmError::Corrupted("stream checksum mismatch".into()));
                    }
                    self.finished = true;
                    return Ok(false);
                }
            }
        }
    }
}
