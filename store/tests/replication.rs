//! End-to-end replication scenarios over the loopback replicator: a primary
//! replica commits through the wire, a secondary replica pumps the copy
//! stream then the replication stream, and the two converge.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serial_test::serial;

use store::config::StoreSettings;
use store::error::CResult;
use store::local::{LocalStore, Lsn, StoreItem};
use store::notify::{NotificationManager, NotificationMode};
use store::progress::{self, Epoch};
use store::replica::{ReplicaRole, ReplicatedStore};
use store::replicator::loopback::{LoopbackReplicator, SecondaryControl};
use store::replicator::StateReplicator;
use store::storage::engine::EngineFactory;
use store::storage::log_store::LogStore;
use store::tombstone::TOMBSTONE_DATA_TYPE;

fn log_store_factory() -> EngineFactory {
    Arc::new(|dir: &Path| {
        Ok(Box::new(LogStore::open(dir)?) as Box<dyn store::storage::engine::Engine>)
    })
}

fn test_settings() -> StoreSettings {
    let _ = env_logger::builder().is_test(true).try_init();
    StoreSettings {
        fabric_time_refresh_interval_ms: 0,
        target_copy_operation_size: 256,
        ..StoreSettings::default()
    }
}

async fn open_replica(
    replicator: Arc<dyn StateReplicator>,
    dir: &Path,
    replica_id: u64,
) -> ReplicatedStore {
    ReplicatedStore::open(
        test_settings(),
        dir.to_path_buf(),
        replica_id,
        log_store_factory(),
        replicator,
        NotificationManager::new(NotificationMode::None, None),
    )
    .await
    .unwrap()
}

/// Pulls pages off the primary's copy enumerator and feeds them into the
/// secondary's copy stream, ending with the end-of-stream sentinel. This is
/// the plumbing the hosting runtime normally provides.
async fn drive_copy_with(
    primary: &ReplicatedStore,
    control: &SecondaryControl,
    context: store::wire::CopyContextData,
) -> CResult<u64> {
    let mut enumerator = primary.create_copy_operation_enumerator(context).await?;
    let mut sequence = 0;
    while let Some(page) = enumerator.get_next().await? {
        sequence += 1;
        control.send_copy_operation(sequence, page.encode()?)?;
    }
    control.send_copy_end_of_stream(sequence + 1)?;
    Ok(sequence as u64)
}

async fn commit_insert(primary: &ReplicatedStore, key: &str, value: &[u8]) -> CResult<Lsn> {
    let mut tx = primary.create_transaction()?;
    tx.insert("data", key, value)?;
    tx.commit().await
}

async fn commit_delete(primary: &ReplicatedStore, key: &str) -> CResult<Lsn> {
    let mut tx = primary.create_transaction()?;
    tx.delete("data", key)?;
    tx.commit().await
}

fn user_rows(store: &LocalStore) -> Vec<StoreItem> {
    let tx = store.create_transaction().unwrap();
    let items = tx
        .enumerate_by_type_and_key("data", "")
        .unwrap()
        .collect::<Vec<_>>();
    tx.rollback();
    items
}

fn row_set(store: &LocalStore) -> Vec<(String, Vec<u8>, Lsn)> {
    user_rows(store)
        .into_iter()
        .map(|item| (item.key, item.value, item.operation_lsn))
        .collect()
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn full_copy_then_replication_converges() -> CResult<()> {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let wire = Arc::new(LoopbackReplicator::new(1, 0));
    let primary = open_replica(wire.clone(), primary_dir.path(), 1).await;
    primary.change_role(ReplicaRole::Primary).await?;
    primary.update_epoch(Epoch::new(1, 1), 0).await?;

    // State committed before the secondary exists travels via copy.
    for i in 0..5 {
        commit_insert(&primary, &format!("k{}", i), format!("v{}", i).as_bytes()).await?;
    }
    let delete_lsn = commit_delete(&primary, "k2").await?;

    let (secondary_view, control) = wire.attach_secondary();

    // Committed after attach but before the build starts: arrives on both
    // the copy and the replication stream; the apply path must be
    // idempotent about it.
    let dup_lsn = commit_insert(&primary, "dup", b"dup-value").await?;

    let secondary = open_replica(Arc::new(secondary_view), secondary_dir.path(), 2).await;
    secondary.change_role(ReplicaRole::IdleSecondary).await?;

    let context = secondary.get_copy_context()?;
    assert!(!context.is_epoch_valid);
    let pages = drive_copy_with(&primary, &control, context).await?;
    assert!(pages > 0);
    assert_eq!(primary.statistics().full_copy_count(), 1);

    // Live replication after the build.
    let live_lsn = commit_insert(&primary, "live", b"live-value").await?;

    // The secondary's store handle is swapped by the build; re-fetch it on
    // every poll.
    wait_for("live row on secondary", || {
        let store = secondary.current_store();
        let tx = store.create_transaction().unwrap();
        tx.contains("data", "live")
    })
    .await;

    let secondary_store = secondary.current_store();
    assert_eq!(row_set(&primary.current_store()), row_set(&secondary_store));

    {
        let tx = secondary_store.create_transaction().unwrap();
        assert_eq!(tx.read_exact("data", "dup")?, (b"dup-value".to_vec(), dup_lsn));
        assert_eq!(tx.read_exact("data", "live")?, (b"live-value".to_vec(), live_lsn));

        // The replicated delete left a tombstone at its LSN.
        assert!(tx.contains(
            TOMBSTONE_DATA_TYPE,
            &format!("0x{:016x}:0", delete_lsn)
        ));

        // Progress metadata converged with the primary.
        assert_eq!(
            progress::read_current_epoch(&tx)?.unwrap().epoch,
            Epoch::new(1, 1)
        );
        assert!(progress::read_epoch_history(&tx)?.is_some());
    }
    assert_eq!(secondary.current_epoch(), Some(Epoch::new(1, 1)));

    primary.close().await?;
    secondary.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn partial_copy_resumes_a_restarted_secondary() -> CResult<()> {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let wire = Arc::new(LoopbackReplicator::new(1, 0));
    let primary = open_replica(wire.clone(), primary_dir.path(), 1).await;
    primary.change_role(ReplicaRole::Primary).await?;
    primary.update_epoch(Epoch::new(1, 1), 0).await?;

    for i in 0..4 {
        commit_insert(&primary, &format!("old{}", i), b"old").await?;
    }

    // First build: full copy into an empty secondary.
    let (secondary_view, control) = wire.attach_secondary();
    let secondary = open_replica(Arc::new(secondary_view), secondary_dir.path(), 2).await;
    secondary.change_role(ReplicaRole::IdleSecondary).await?;
    let context = secondary.get_copy_context()?;
    drive_copy_with(&primary, &control, context).await?;

    wait_for("first build to land", || {
        let store = secondary.current_store();
        let tx = store.create_transaction().unwrap();
        tx.contains("data", "old3")
    })
    .await;
    let first_build_lsn = secondary.last_committed_lsn();
    assert!(first_build_lsn > 0);

    // The secondary restarts: close it, advance the primary through a new
    // epoch and more writes.
    secondary.close().await?;
    drop(secondary);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let prev_last = primary.last_committed_lsn();
    primary.update_epoch(Epoch::new(1, 2), prev_last).await?;
    for i in 0..3 {
        commit_insert(&primary, &format!("new{}", i), b"new").await?;
    }

    // Second build: the secondary reports real progress under epoch E1 and
    // gets an incremental copy from its last committed LSN.
    let (secondary_view, control) = wire.attach_secondary();
    let secondary = open_replica(Arc::new(secondary_view), secondary_dir.path(), 2).await;
    let context = secondary.get_copy_context()?;
    assert!(context.is_epoch_valid);
    assert_eq!(context.epoch, Epoch::new(1, 1));
    assert_eq!(context.last_operation_lsn, first_build_lsn);

    secondary.change_role(ReplicaRole::IdleSecondary).await?;
    drive_copy_with(&primary, &control, context).await?;

    wait_for("partial build to land", || {
        let store = secondary.current_store();
        let tx = store.create_transaction().unwrap();
        tx.contains("data", "new2")
    })
    .await;

    assert_eq!(primary.statistics().partial_copy_count(), 1);
    assert_eq!(primary.statistics().false_progress_count(), 0);

    let secondary_store = secondary.current_store();
    assert_eq!(row_set(&primary.current_store()), row_set(&secondary_store));
    {
        let tx = secondary_store.create_transaction().unwrap();
        assert_eq!(
            progress::read_current_epoch(&tx)?.unwrap().epoch,
            Epoch::new(1, 2)
        );
        let history = progress::read_epoch_history(&tx)?.unwrap();
        assert_eq!(history.entries.last().unwrap().epoch, Epoch::new(1, 2));

        // Partial copies never transfer the low watermark row.
        assert!(progress::read_low_watermark(&tx)?.is_none());
    }

    primary.close().await?;
    secondary.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn quorum_acked_commits_complete_in_lsn_order() -> CResult<()> {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    // Quorum requires the secondary's ack: primary commits only complete
    // once the pump has applied and acked them.
    let wire = Arc::new(LoopbackReplicator::new(1, 1));
    let primary = open_replica(wire.clone(), primary_dir.path(), 1).await;
    primary.change_role(ReplicaRole::Primary).await?;
    primary.update_epoch(Epoch::new(1, 1), 0).await?;

    let (secondary_view, control) = wire.attach_secondary();
    let secondary = open_replica(Arc::new(secondary_view), secondary_dir.path(), 2).await;
    secondary.change_role(ReplicaRole::IdleSecondary).await?;
    let context = secondary.get_copy_context()?;
    drive_copy_with(&primary, &control, context).await?;

    let mut lsns = Vec::new();
    for i in 0..6 {
        lsns.push(commit_insert(&primary, &format!("q{}", i), b"q").await?);
    }

    // Strictly increasing completion order observed by the caller.
    let mut sorted = lsns.clone();
    sorted.sort_unstable();
    assert_eq!(lsns, sorted);
    assert!(lsns.windows(2).all(|w| w[0] < w[1]));

    // Quorum ack implies the secondary already applied everything.
    let secondary_store = secondary.current_store();
    let tx = secondary_store.create_transaction().unwrap();
    for (i, lsn) in lsns.iter().enumerate() {
        assert_eq!(tx.get_operation_lsn("data", &format!("q{}", i))?, *lsn);
    }
    drop(tx);

    assert!(wire.last_quorum_acked_lsn() >= *lsns.last().unwrap());

    primary.close().await?;
    secondary.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn false_progress_secondary_gets_a_full_copy() -> CResult<()> {
    let primary_dir = tempfile::tempdir().unwrap();
    let secondary_dir = tempfile::tempdir().unwrap();

    let wire = Arc::new(LoopbackReplicator::new(1, 0));
    let primary = open_replica(wire.clone(), primary_dir.path(), 1).await;
    primary.change_role(ReplicaRole::Primary).await?;
    primary.update_epoch(Epoch::new(1, 1), 0).await?;
    commit_insert(&primary, "a", b"1").await?;

    let (secondary_view, control) = wire.attach_secondary();
    let secondary = open_replica(Arc::new(secondary_view), secondary_dir.path(), 2).await;
    secondary.change_role(ReplicaRole::IdleSecondary).await?;

    // A context claiming progress past the primary's history.
    let mut context = secondary.get_copy_context()?;
    context.is_epoch_valid = true;
    context.epoch = Epoch::new(1, 1);
    context.last_operation_lsn = primary.last_committed_lsn() + 100;

    drive_copy_with(&primary, &control, context).await?;
    assert_eq!(primary.statistics().false_progress_count(), 1);
    assert_eq!(primary.statistics().full_copy_count(), 1);

    wait_for("full copy to land", || {
        let store = secondary.current_store();
        let tx = store.create_transaction().unwrap();
        tx.contains("data", "a")
    })
    .await;

    primary.close().await?;
    secondary.close().await?;
    Ok(())
}
