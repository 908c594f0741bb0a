//! Snapshot sessions: chunked byte streams with cooperative cancellation.
//!
//! A write session produces a sequence of checksummed chunks; a read session
//! consumes the same chunks in order. Cancellation is level-triggered and is
//! observed between chunks, including while a chunk send or receive is
//! blocked on a full (or empty) stream.
//!
//! # Stream format
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Frame header (13 bytes)              │
//! │ ├─ magic: u32 (0x534E4150 "SNAP")    │
//! │ ├─ kind: u8 (0 = data, 1 = end)      │
//! │ ├─ length: u32                       │
//! │ └─ checksum: u32 (CRC32 of payload)  │
//! ├──────────────────────────────────────┤
//! │ Payload                              │
//! └──────────────────────────────────────┘
//! ```
//!
//! The end frame carries the total data length and a CRC32 over all data
//! bytes. A stream that stops before its end frame is truncated and every
//! reader reports it as corrupted.
//!
//! # Example
//!
//! ```no_run
//! use snapshot::{cancel_pair, snapshot_channel, SnapshotReader, SnapshotWriter};
//!
//! # async fn example() -> common::SmResult<()> {
//! let (_handle, signal) = cancel_pair();
//! let (sink, source) = snapshot_channel(4);
//! let mut writer = SnapshotWriter::new(sink, signal.clone(), 1024);
//! let mut reader = SnapshotReader::new(source, signal);
//!
//! let producer = tokio::spawn(async move {
//!     writer.write(b"x=1").await?;
//!     writer.finish().await
//! });
//! let bytes = reader.read_to_end().await?;
//! assert_eq!(bytes, b"x=1");
//! producer.await.unwrap()?;
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
mod tests;

pub mod cancel;
pub mod codec;
pub mod frame;
pub mod manifest;
pub mod reader;
pub mod sink;
pub mod store;
pub mod writer;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use manifest::{FileManifest, SnapshotFile};
pub use reader::SnapshotReader;
pub use sink::{
    snapshot_channel, ChannelSink, ChannelSource, ChunkSink, ChunkSource, FileSink, FileSource,
};
pub use store::{PendingSnapshot, SnapshotStore, StoredSnapshot};
pub use writer::SnapshotWriter;
