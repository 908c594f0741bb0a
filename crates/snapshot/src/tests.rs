use super::*;
use crate::frame::{decode_frame, encode_frame, FrameKind};
use bytes::{Bytes, BytesMut};
use common::SmError;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tempfile::tempdir;

fn pipe(capacity: usize, chunk_size: usize) -> (CancelHandle, SnapshotWriter, SnapshotReader) {
    let (handle, signal) = cancel_pair();
    let (sink, source) = snapshot_channel(capacity);
    let writer = SnapshotWriter::new(sink, signal.clone(), chunk_size);
    let reader = SnapshotReader::new(source, signal);
    (handle, writer, reader)
}

#[tokio::test]
async fn channel_roundtrip_spans_many_chunks() {
    let (_handle, mut writer, mut reader) = pipe(2, 7);
    let payload: Vec<u8> = (0..200u8).collect();
    let expected = payload.clone();

    let producer = tokio::spawn(async move {
        writer.write(&payload).await?;
        writer.finish().await
    });

    let received = reader.read_to_end().await.unwrap();
    assert_eq!(received, expected);
    assert!(reader.is_finished());
    assert_eq!(producer.await.unwrap().unwrap(), 200);
}

#[tokio::test]
async fn values_roundtrip_through_stream() {
    let (_handle, mut writer, mut reader) = pipe(4, 16);
    let producer = tokio::spawn(async move {
        writer.write_value(&(42u64, "alpha".to_string())).await?;
        writer.write_value(&vec![1u32, 2, 3]).await?;
        writer.finish().await
    });

    let first: (u64, String) = reader.read_value().await.unwrap();
    let second: Vec<u32> = reader.read_value().await.unwrap();
    reader.finish().await.unwrap();

    assert_eq!(first, (42, "alpha".to_string()));
    assert_eq!(second, vec![1, 2, 3]);
    producer.await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_stream_is_valid() {
    let (_handle, mut writer, mut reader) = pipe(1, 8);
    let producer = tokio::spawn(async move { writer.finish().await });
    assert!(reader.read_to_end().await.unwrap().is_empty());
    assert_eq!(producer.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn cancel_interrupts_blocked_writer() {
    // Capacity 1 and nobody reading: the second chunk blocks.
    let (handle, mut writer, _reader) = pipe(1, 4);
    let producer = tokio::spawn(async move { writer.write(&[0u8; 64]).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), producer)
        .await
        .expect("writer did not observe cancellation")
        .unwrap();
    assert!(matches!(result, Err(SmError::Cancelled)));
}

#[tokio::test]
async fn cancel_interrupts_blocked_reader() {
    let (handle, _writer, mut reader) = pipe(1, 4);
    let consumer = tokio::spawn(async move { reader.read_to_end().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .expect("reader did not observe cancellation")
        .unwrap();
    assert!(matches!(result, Err(SmError::Cancelled)));
}

#[tokio::test]
async fn aborted_writer_yields_truncated_stream() {
    let (_handle, mut writer, mut reader) = pipe(8, 4);
    writer.write(b"partial state").await.unwrap();
    writer.abort().await;

    let result = reader.read_to_end().await;
    assert!(matches!(result, Err(SmError::Corrupted(_))));
    assert!(writer.finish().await.is_err());
}

#[tokio::test]
async fn unread_bytes_fail_finish() {
    let (_handle, mut writer, mut reader) = pipe(8, 64);
    writer.write(b"abcdef").await.unwrap();
    writer.finish().await.unwrap();

    let mut two = [0u8; 2];
    reader.read_exact(&mut two).await.unwrap();
    assert_eq!(&two, b"ab");
    assert!(matches!(reader.finish().await, Err(SmError::Corrupted(_))));
}

#[tokio::test]
async fn short_stream_fails_read_exact() {
    let (_handle, mut writer, mut reader) = pipe(8, 64);
    writer.write(b"abc").await.unwrap();
    writer.finish().await.unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(reader.read_exact(&mut buf).await, Err(SmError::Corrupted(_))));
}

#[test]
fn frame_checksum_detects_corruption() {
    let frame = encode_frame(FrameKind::Data, b"hello");
    assert_eq!(decode_frame(frame.clone()).unwrap().payload, Bytes::from_static(b"hello"));

    let mut damaged = BytesMut::from(&frame[..]);
    let last = damaged.len() - 1;
    damaged[last] ^= 0xFF;
    assert!(matches!(decode_frame(damaged.freeze()), Err(SmError::Corrupted(_))));
}

#[test]
fn frame_rejects_bad_magic() {
    let mut frame = BytesMut::from(&encode_frame(FrameKind::Data, b"x")[..]);
    frame[0] = 0;
    assert!(matches!(decode_frame(frame.freeze()), Err(SmError::Corrupted(_))));
}

#[tokio::test]
async fn file_sink_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snap");

    let sink = FileSink::create(&path).await.unwrap();
    let mut writer = SnapshotWriter::new(sink, CancelSignal::never(), 5);
    writer.write(b"persisted snapshot bytes").await.unwrap();
    writer.finish().await.unwrap();
    assert!(path.exists());

    let source = FileSource::open(&path).await.unwrap();
    let mut reader = SnapshotReader::new(source, CancelSignal::never());
    assert_eq!(reader.read_to_end().await.unwrap(), b"persisted snapshot bytes");
}

#[tokio::test]
async fn aborted_file_sink_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snap");

    let sink = FileSink::create(&path).await.unwrap();
    let mut writer = SnapshotWriter::new(sink, CancelSignal::never(), 4);
    writer.write(b"half written").await.unwrap();
    writer.abort().await;

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
}

#[tokio::test]
async fn truncated_file_is_corrupted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.snap");

    let sink = FileSink::create(&path).await.unwrap();
    let mut writer = SnapshotWriter::new(sink, CancelSignal::never(), 4);
    writer.write(b"0123456789").await.unwrap();
    writer.finish().await.unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let source = FileSource::open(&path).await.unwrap();
    let mut reader = SnapshotReader::new(source, CancelSignal::never());
    assert!(matches!(reader.read_to_end().await, Err(SmError::Corrupted(_))));
}

#[test]
fn manifest_rejects_duplicate_ids() {
    let mut manifest = FileManifest::new();
    manifest.add_file(1, "/tmp/a.db", b"meta".to_vec()).unwrap();
    assert!(manifest.add_file(1, "/tmp/b.db", Vec::new()).is_err());
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest.get(1).unwrap().metadata, b"meta");
}

#[test]
fn manifest_reports_missing_files() {
    let dir = tempdir().unwrap();
    let present = dir.path().join("present.db");
    std::fs::write(&present, b"data").unwrap();

    let mut manifest = FileManifest::new();
    manifest.add_file(1, &present, Vec::new()).unwrap();
    assert!(manifest.validate_present().is_ok());

    manifest.add_file(2, dir.path().join("absent.db"), Vec::new()).unwrap();
    assert!(matches!(manifest.validate_present(), Err(SmError::MissingFile(_))));
}

#[test]
fn manifest_copy_and_relocate() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let file = src.path().join("checkpoint-1.db");
    std::fs::write(&file, b"checkpoint").unwrap();

    let mut manifest = FileManifest::new();
    manifest.add_file(9, &file, b"m".to_vec()).unwrap();

    let copied = manifest.copy_into(dst.path()).unwrap();
    let target = dst.path().join("checkpoint-1.db");
    assert_eq!(copied.get(9).unwrap().path, target);
    assert_eq!(std::fs::read(&target).unwrap(), b"checkpoint");

    let relocated = manifest.relocate("/remote/place").unwrap();
    assert_eq!(
        relocated.get(9).unwrap().path,
        std::path::PathBuf::from("/remote/place/checkpoint-1.db")
    );
}

async fn store_snapshot(store: &SnapshotStore, index: u64, body: &[u8]) -> StoredSnapshot {
    let (mut writer, pending) = store.begin(CancelSignal::never(), 8).await.unwrap();
    writer.write(body).await.unwrap();
    writer.finish().await.unwrap();
    store.commit(pending, index, &FileManifest::new()).unwrap()
}

#[tokio::test]
async fn store_commit_and_latest() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    assert!(store.latest().unwrap().is_none());

    store_snapshot(&store, 5, b"five").await;
    let newest = store_snapshot(&store, 9, b"nine").await;

    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest, newest);

    let mut reader = store.reader(&latest, CancelSignal::never()).await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), b"nine");
}

#[tokio::test]
async fn store_prunes_oldest() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::open(dir.path(), 2).unwrap();
    for index in [3, 6, 9, 12] {
        store_snapshot(&store, index, b"state").await;
    }

    let indexes: Vec<u64> = store.list().unwrap().iter().map(|s| s.index).collect();
    assert_eq!(indexes, vec![9, 12]);
}

#[tokio::test]
async fn uncommitted_snapshot_is_invisible() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    let (mut writer, pending) = store.begin(CancelSignal::never(), 8).await.unwrap();
    writer.write(b"never committed").await.unwrap();
    writer.finish().await.unwrap();

    assert!(store.latest().unwrap().is_none());
    store.discard(pending);
    assert!(store.list().unwrap().is_empty());
}

#[tokio::test]
async fn store_copies_manifest_files() {
    let dir = tempdir().unwrap();
    let data = tempdir().unwrap();
    let file = data.path().join("checkpoint-4.db");
    std::fs::write(&file, b"cp").unwrap();

    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    let (mut writer, pending) = store.begin(CancelSignal::never(), 8).await.unwrap();
    writer.finish().await.unwrap();

    let mut manifest = FileManifest::new();
    manifest.add_file(1, &file, Vec::new()).unwrap();
    let stored = store.commit(pending, 4, &manifest).unwrap();

    // The original may now disappear; the store keeps its own copy.
    std::fs::remove_file(&file).unwrap();
    stored.manifest.validate_present().unwrap();
}

#[tokio::test]
async fn reopened_store_continues_sequence() {
    let dir = tempdir().unwrap();
    let first = {
        let store = SnapshotStore::open(dir.path(), 3).unwrap();
        store_snapshot(&store, 1, b"a").await
    };
    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    let second = store_snapshot(&store, 2, b"b").await;
    assert!(second.seq > first.seq);
}

fn snap_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".snap") || name.ends_with(".files"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn failed_commit_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    let (mut writer, pending) = store.begin(CancelSignal::never(), 8).await.unwrap();
    writer.write(b"state").await.unwrap();
    writer.finish().await.unwrap();

    let mut manifest = FileManifest::new();
    manifest
        .add_file(1, dir.path().join("gone.bin"), Vec::new())
        .unwrap();
    let err = store.commit(pending, 7, &manifest).unwrap_err();
    assert!(matches!(err, SmError::MissingFile(_)), "{err}");

    assert!(store.list().unwrap().is_empty());
    assert!(snap_files(dir.path()).is_empty());
}

#[tokio::test]
async fn reopen_removes_unrecorded_streams() {
    let dir = tempdir().unwrap();
    let kept = {
        let store = SnapshotStore::open(dir.path(), 3).unwrap();
        let kept = store_snapshot(&store, 1, b"kept").await;

        // Stream finished, then the process died before the record was written.
        let (mut writer, _pending) = store.begin(CancelSignal::never(), 8).await.unwrap();
        writer.write(b"orphan").await.unwrap();
        writer.finish().await.unwrap();
        std::fs::create_dir_all(dir.path().join(format!("snapshot-{:020}.files", kept.seq + 1)))
            .unwrap();
        kept
    };
    assert_eq!(snap_files(dir.path()).len(), 3);

    let store = SnapshotStore::open(dir.path(), 3).unwrap();
    assert_eq!(
        snap_files(dir.path()),
        vec![format!("snapshot-{:020}.snap", kept.seq)]
    );
    assert_eq!(store.list().unwrap(), vec![kept.clone()]);

    let next = store_snapshot(&store, 2, b"next").await;
    assert!(next.seq > kept.seq);
}

#[tokio::test]
async fn oversized_value_length_is_rejected() {
    let (_handle, mut writer, mut reader) = pipe(4, 16);
    let producer = tokio::spawn(async move {
        writer.write(&u32::MAX.to_le_bytes()).await?;
        writer.write(b"tail").await?;
        writer.finish().await
    });

    let err = reader.read_value::<Vec<u8>>().await.unwrap_err();
    assert!(matches!(err, SmError::Corrupted(_)), "{err}");
    drop(reader);
    let _ = producer.await.unwrap();
}
