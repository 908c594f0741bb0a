use common::{EntryResult, HostConfig, ReplicaId, SmError};
use kv::DiskKv;
use pretty_assertions::assert_eq;
use rsm::{Host, Outcome, RejectReason};
use snapshot::{cancel_pair, CancelSignal};
use std::time::Duration;
use testsupport::prelude::*;

#[tokio::test]
async fn example_batch_on_every_machine() {
    let node = TestNode::new().unwrap();
    let mut hashes = Vec::new();
    for (member, machine) in ALL_MACHINES.iter().enumerate() {
        let host = node.host(machine, member as u64 + 1).await.unwrap();
        let result = host.apply(&example_batch()).await.unwrap();
        assert_eq!(result.applied_index, 2, "{machine}");
        assert_eq!(
            result.outcomes,
            vec![
                Outcome::Applied(EntryResult::new(1)),
                Outcome::Applied(EntryResult::new(1)),
            ],
            "{machine}"
        );
        assert_value(&host, "x", "2").await;
        hashes.push(host.hash().await.unwrap());
    }
    assert!(hashes.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn gap_halts_every_machine() {
    let node = TestNode::new().unwrap();
    for (member, machine) in ALL_MACHINES.iter().enumerate() {
        let host = node.host(machine, member as u64 + 1).await.unwrap();
        host.apply(&example_batch()).await.unwrap();

        let result = host.apply(&kv_entries(4, &["y=1"])).await;
        match &result {
            Err(SmError::OrderingViolation { expected, got }) => {
                assert_eq!((*expected, *got), (3, 4), "{machine}");
            }
            other => panic!("{machine}: expected an ordering violation, got {other:?}"),
        }
        assert_fatal(&host, result);

        // Nothing is served once halted.
        assert!(host.lookup(b"x").await.unwrap_err().is_fatal());
        assert!(host.apply(&kv_entries(3, &["y=1"])).await.is_err());
        assert_eq!(host.applied_index(), 2);
    }
}

#[tokio::test]
async fn streamed_snapshot_between_members() {
    let node = TestNode::new().unwrap();
    for (i, machine) in ALL_MACHINES.iter().enumerate() {
        let source = node.host(machine, 10 + i as u64).await.unwrap();
        let target = node.host(machine, 20 + i as u64).await.unwrap();
        source.apply(&numbered_sets(1, 40)).await.unwrap();
        source.apply(&kv_entries(41, &["-key3", "key4=changed"])).await.unwrap();

        let index = transfer(&source, None, &target).await.unwrap();
        assert_eq!(index, 42, "{machine}");
        assert_same_state(&source, &target).await;
        assert_missing(&target, "key3").await;
        assert_value(&target, "key4", "changed").await;

        // The target keeps applying where the snapshot left off.
        target.apply(&kv_entries(43, &["after=1"])).await.unwrap();
        assert_value(&target, "after", "1").await;
    }
}

#[tokio::test]
async fn self_managed_stream_longer_than_the_channel() {
    let config = HostConfig::builder()
        .snapshot_chunk_size(1)
        .stream_capacity(1)
        .max_client_sessions(256)
        .build();
    let node = TestNode::with_config(config).unwrap();
    let source = node.host(kv::DISK_KV, 1).await.unwrap();
    let target = node.host(kv::DISK_KV, 2).await.unwrap();
    // Every registered client adds to the stream; one byte per frame puts it
    // thousands of frames past the channel.
    let registrations: Vec<_> = (1..=256).map(|id| register_entry(id, id)).collect();
    source.apply(&registrations).await.unwrap();
    source.apply(&numbered_sets(257, 40)).await.unwrap();

    let index = tokio::time::timeout(Duration::from_secs(30), transfer(&source, None, &target))
        .await
        .expect("transfer stalled")
        .unwrap();
    assert_eq!(index, 296);
    assert_same_state(&source, &target).await;
}

#[tokio::test]
async fn prepared_context_excludes_later_updates() {
    let node = TestNode::new().unwrap();
    for (i, machine) in [kv::VERSIONED_KV, kv::DISK_KV].iter().enumerate() {
        let source = node.host(machine, 30 + i as u64).await.unwrap();
        let target = node.host(machine, 40 + i as u64).await.unwrap();
        source.apply(&kv_entries(1, &["a=1", "b=2"])).await.unwrap();

        let context = source.prepare_snapshot().await.unwrap();
        assert_eq!(context.index(), 2);
        source.apply(&kv_entries(3, &["a=changed", "c=3"])).await.unwrap();

        let index = transfer(&source, Some(context), &target).await.unwrap();
        assert_eq!(index, 2, "{machine}");
        assert_value(&target, "a", "1").await;
        assert_missing(&target, "c").await;
        assert_value(&source, "a", "changed").await;
    }
}

#[tokio::test]
async fn second_prepare_waits_for_the_first() {
    let node = TestNode::new().unwrap();
    let host = node.host(kv::VERSIONED_KV, 1).await.unwrap();
    host.apply(&example_batch()).await.unwrap();

    let context = host.prepare_snapshot().await.unwrap();
    let second = host.prepare_snapshot().await;
    assert!(matches!(second, Err(SmError::SnapshotInProgress)));

    context.release();
    let again = host.prepare_snapshot().await.unwrap();
    assert_eq!(again.index(), 2);
}

#[tokio::test]
async fn sequential_machines_reject_prepare() {
    let node = TestNode::new().unwrap();
    let host = node.host(kv::MEM_KV, 1).await.unwrap();
    let err = assert_recoverable(&host, host.prepare_snapshot().await);
    assert!(matches!(err, SmError::Unsupported(_)));
}

#[tokio::test]
async fn cancelled_save_leaves_both_sides_alone() {
    let node = TestNode::new().unwrap();
    for (i, machine) in ALL_MACHINES.iter().enumerate() {
        let source = node.host(machine, 50 + i as u64).await.unwrap();
        let target = node.host(machine, 60 + i as u64).await.unwrap();
        source.apply(&numbered_sets(1, 10)).await.unwrap();
        target.apply(&kv_entries(1, &["mine=1"])).await.unwrap();
        let source_hash = source.hash().await.unwrap();
        let target_hash = target.hash().await.unwrap();

        let (save_handle, save_cancel) = cancel_pair();
        save_handle.cancel();
        let result =
            transfer_with(&source, None, &target, save_cancel, CancelSignal::never()).await;
        assert!(matches!(result, Err(SmError::Cancelled)), "{machine}: {result:?}");

        assert!(!source.is_halted() && !target.is_halted(), "{machine}");
        assert_eq!(source.applied_index(), 10);
        assert_eq!(source.hash().await.unwrap(), source_hash);
        assert_eq!(target.applied_index(), 1);
        assert_eq!(target.hash().await.unwrap(), target_hash);
        assert_value(&target, "mine", "1").await;
    }
}

#[tokio::test]
async fn cancelled_recovery_keeps_previous_state() {
    let node = TestNode::new().unwrap();
    for (i, machine) in ALL_MACHINES.iter().enumerate() {
        let source = node.host(machine, 70 + i as u64).await.unwrap();
        let target = node.host(machine, 80 + i as u64).await.unwrap();
        source.apply(&numbered_sets(1, 10)).await.unwrap();
        target.apply(&kv_entries(1, &["mine=1", "other=2"])).await.unwrap();
        let target_hash = target.hash().await.unwrap();

        let (recover_handle, recover_cancel) = cancel_pair();
        recover_handle.cancel();
        let result =
            transfer_with(&source, None, &target, CancelSignal::never(), recover_cancel).await;
        assert!(matches!(result, Err(SmError::Cancelled)), "{machine}: {result:?}");

        assert!(!target.is_halted(), "{machine}");
        assert_eq!(target.applied_index(), 2);
        assert_eq!(target.hash().await.unwrap(), target_hash);
        assert_missing(&target, "key0").await;
    }
}

#[tokio::test]
async fn snapshot_from_another_group_is_rejected() {
    let node = TestNode::new().unwrap();
    let source = node
        .hosts()
        .create_with(ReplicaId::new(TEST_GROUP + 1, 1), kv::MEM_KV)
        .await
        .unwrap();
    let target = node.host(kv::MEM_KV, 1).await.unwrap();
    source.apply(&example_batch()).await.unwrap();

    let result = transfer(&source, None, &target).await;
    assert!(matches!(result, Err(SmError::GroupMismatch { .. })), "{result:?}");
    assert!(!target.is_halted());
    assert_eq!(target.applied_index(), 0);
}

#[tokio::test]
async fn synced_index_survives_restart() {
    let node = TestNode::new().unwrap();
    let host = node.host(kv::DISK_KV, 1).await.unwrap();
    host.apply(&numbered_sets(1, 5)).await.unwrap();
    assert_eq!(host.sync().await.unwrap(), 5);
    host.apply(&kv_entries(6, &["late=1"])).await.unwrap();

    let reopened = node.restart(kv::DISK_KV, 1).await.unwrap();
    assert_eq!(reopened.applied_index(), 6);
    assert_value(&reopened, "key4", "value4").await;
    assert_value(&reopened, "late", "1").await;
}

#[tokio::test]
async fn crash_keeps_at_least_the_synced_index() {
    let dir = tempfile::tempdir().unwrap();
    let replica = ReplicaId::new(TEST_GROUP, 1);
    let config = HostConfig::default();

    {
        let host =
            Host::create(replica, config.clone(), Box::new(DiskKv::new(dir.path()))).unwrap();
        host.open(&CancelSignal::never()).await.unwrap();
        host.apply(&numbered_sets(1, 3)).await.unwrap();
        assert_eq!(host.sync().await.unwrap(), 3);
        host.apply(&kv_entries(4, &["unsynced=1"])).await.unwrap();
        // Dropped without close.
    }

    let host = Host::create(replica, config, Box::new(DiskKv::new(dir.path()))).unwrap();
    let index = host.open(&CancelSignal::never()).await.unwrap();
    assert!(index >= 3, "reopened at {index}");
    assert_eq!(host.applied_index(), index);
    for i in 0..3 {
        assert_value(&host, &format!("key{i}"), &format!("value{i}")).await;
    }
    host.apply(&kv_entries(index + 1, &["next=1"])).await.unwrap();
}

#[tokio::test]
async fn self_managed_machine_must_be_opened() {
    let node = TestNode::new().unwrap();
    let host = node
        .hosts()
        .create_with(ReplicaId::new(TEST_GROUP, 9), kv::DISK_KV)
        .await
        .unwrap();
    let result = host.apply(&example_batch()).await;
    assert!(matches!(result, Err(SmError::NotOpened)), "{result:?}");

    assert_eq!(host.open(&CancelSignal::never()).await.unwrap(), 0);
    host.apply(&example_batch()).await.unwrap();
    assert_eq!(host.open(&CancelSignal::never()).await.unwrap(), 2);
}

#[tokio::test]
async fn duplicate_proposal_answered_after_snapshot() {
    let node = TestNode::new().unwrap();
    for (i, machine) in [kv::MEM_KV, kv::VERSIONED_KV].iter().enumerate() {
        let source = node.host(machine, 90 + i as u64).await.unwrap();
        let target = node.host(machine, 95 + i as u64).await.unwrap();
        let result = source
            .apply(&[register_entry(1, 7), proposal_entry(2, 7, 1, 0, "x=1")])
            .await
            .unwrap();
        assert_eq!(
            result.outcomes,
            vec![Outcome::Registered, Outcome::Applied(EntryResult::new(1))]
        );

        transfer(&source, None, &target).await.unwrap();

        // The retried proposal is answered from the recorded result.
        let retried = target
            .apply(&[proposal_entry(3, 7, 1, 0, "x=overwritten")])
            .await
            .unwrap();
        assert_eq!(retried.outcomes, vec![Outcome::Duplicate(EntryResult::new(1))]);
        assert_value(&target, "x", "1").await;

        let after = target
            .apply(&[unregister_entry(4, 7), proposal_entry(5, 7, 2, 1, "x=2")])
            .await
            .unwrap();
        assert_eq!(
            after.outcomes,
            vec![
                Outcome::Unregistered,
                Outcome::Rejected(RejectReason::SessionNotFound),
            ]
        );
        assert_eq!(target.applied_index(), 5);
    }
}

#[tokio::test]
async fn hosts_create_and_destroy() {
    let node = TestNode::new().unwrap();
    let hosts = node.hosts();
    let first = ReplicaId::new(TEST_GROUP, 1);
    let second = ReplicaId::new(TEST_GROUP, 2);

    hosts.create(first).await.unwrap();
    hosts.create_with(second, kv::VERSIONED_KV).await.unwrap();
    assert!(matches!(
        hosts.create(first).await,
        Err(SmError::Machine(_))
    ));
    assert_eq!(hosts.replicas().await, vec![first, second]);

    let host = hosts.get(first).await.unwrap();
    hosts.destroy(first).await.unwrap();
    assert!(host.is_closed());
    assert!(hosts.get(first).await.is_none());
    assert!(hosts.destroy(first).await.is_err());

    hosts.shutdown().await.unwrap();
    assert_eq!(hosts.len().await, 0);
}

#[tokio::test]
async fn script_output() {
    let node = TestNode::new().unwrap();
    let host = node.host(kv::DISK_KV, 1).await.unwrap();
    let output = run_script(
        &host,
        r#"
        # two sets, then a delete
        x=1
        x=2
        get x
        -x
        y=3
        get x
        get y
        index
        sync
        "#,
    )
    .await
    .unwrap();

    assert_eq!(
        output,
        "applied 2 through 2\n\
         x = 2\n\
         applied 2 through 4\n\
         x missing\n\
         y = 3\n\
         index 4\n\
         synced 4\n"
    );
}

#[tokio::test]
async fn store_transfer_and_retention() {
    let node = TestNode::new().unwrap();
    let store = node.store(2).unwrap();
    for (i, machine) in ALL_MACHINES.iter().enumerate() {
        let source = node.host(machine, 100 + i as u64).await.unwrap();
        let target = node.host(machine, 110 + i as u64).await.unwrap();
        source.apply(&numbered_sets(1, 25)).await.unwrap();

        let index = transfer_via_store(&source, &target, &store).await.unwrap();
        assert_eq!(index, 25, "{machine}");
        assert_same_state(&source, &target).await;
    }

    let kept = store.list().unwrap();
    assert_eq!(kept.len(), 2);
    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest.seq, kept.iter().map(|s| s.seq).max().unwrap());
    assert_eq!(latest.index, 25);
}
