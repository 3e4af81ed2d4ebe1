//! The primary commit pipeline.
//!
//! Committed transactions are serialized into `AtomicOperation` buffers and
//! handed to the wire replicator, which assigns the LSN synchronously and
//! completes asynchronously on quorum ack. Completed operations drain a
//! pending-commits queue from the front in LSN order: each drained entry has
//! its rows stamped with the assigned LSN, its deletes finalized into
//! tombstones, and its local transaction committed before the caller is
//! completed. A single flushing task drains at a time; concurrent
//! completions enqueue but do not flush.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::StoreSettings;
use crate::error::{CResult, Error};
use crate::health::HealthTracker;
use crate::local::{LocalStore, Lsn, StoreTransaction};
use crate::replicator::{FaultType, StateReplicator};
use crate::throttle::Throttle;
use crate::tombstone;
use crate::wire::{AtomicOperation, ReplicationOperation, ReplicationOperationKind};

pub type TombstoneCommitCallback = Arc<dyn Fn(u64) + Send + Sync>;

struct PendingCommit {
    lsn: Lsn,
    tx: Option<StoreTransaction>,
    operations: Vec<ReplicationOperation>,
    completion: Option<oneshot::Sender<CResult<Lsn>>>,
    replicated: bool,
    error: Option<Error>,
}

struct QueueState {
    queue: VecDeque<PendingCommit>,
    highest_completed: Lsn,
    flushing: bool,
    /// No new commits admitted; outstanding ones finish naturally.
    closed: bool,
    /// A local commit failed; everything still queued fails with NotPrimary.
    faulted: bool,
}

struct ReplicatorInner {
    store: LocalStore,
    replicator: Arc<dyn StateReplicator>,
    settings: StoreSettings,
    health: Arc<HealthTracker>,
    throttle: Mutex<Option<Arc<Throttle>>>,
    on_tombstones_committed: Mutex<Option<TombstoneCommitCallback>>,
    queue: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct TransactionReplicator {
    inner: Arc<ReplicatorInner>,
}

impl TransactionReplicator {
    pub fn new(
        store: LocalStore,
        replicator: Arc<dyn StateReplicator>,
        settings: StoreSettings,
        health: Arc<HealthTracker>,
    ) -> Self {
        TransactionReplicator {
            inner: Arc::new(ReplicatorInner {
                store,
                replicator,
                settings,
                health,
                throttle: Mutex::new(None),
                on_tombstones_committed: Mutex::new(None),
                queue: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    highest_completed: 0,
                    flushing: false,
                    closed: false,
                    faulted: false,
                }),
            }),
        }
    }

    pub fn set_throttle(&self, throttle: Arc<Throttle>) {
        *lock(&self.inner.throttle) = Some(throttle);
    }

    pub fn set_tombstone_callback(&self, callback: TombstoneCommitCallback) {
        *lock(&self.inner.on_tombstones_committed) = Some(callback);
    }

    pub fn is_throttle_needed(&self) -> bool {
        lock(&self.inner.throttle)
            .as_ref()
            .map(|t| t.is_throttle_needed())
            .unwrap_or(false)
    }

    /// Stops admitting new commits. Outstanding commits finish or fail
    /// naturally.
    pub fn close(&self) {
        lock(&self.inner.queue).closed = true;
    }

    /// Replicates a writable transaction and completes when both the quorum
    /// ack and the local commit have finished, in LSN order relative to
    /// every other commit on this primary.
    ///
    /// On timeout the caller observes `Timeout` but the commit is not rolled
    /// back; it may still complete.
    pub async fn replicate_commit(
        &self,
        tx: StoreTransaction,
        operations: Vec<ReplicationOperation>,
        activity_id: Uuid,
        timeout: Option<Duration>,
    ) -> CResult<Lsn> {
        let atomic = AtomicOperation::new(
            activity_id,
            operations.clone(),
            self.inner.replicator.last_quorum_acked_lsn(),
        );
        let payload = atomic.encode()?;

        let (done_tx, done_rx) = oneshot::channel();

        // Issue order must equal LSN order, so the replicate call and the
        // queue insert happen under one lock.
        let pending = {
            let mut queue = lock(&self.inner.queue);
            if queue.closed || queue.faulted {
                tx.rollback();
                return Err(Error::NotPrimary);
            }

            let pending = match self.inner.replicator.begin_replicate(payload) {
                Ok(pending) => pending,
                Err(err) => {
                    drop(queue);
                    tx.rollback();
                    return Err(err);
                }
            };

            queue.queue.push_back(PendingCommit {
                lsn: pending.lsn,
                tx: Some(tx),
                operations,
                completion: Some(done_tx),
                replicated: false,
                error: None,
            });
            pending
        };

        let lsn = pending.lsn;
        let this = self.clone();
        tokio::spawn(async move {
            let result = match pending.completion.await {
                Ok(result) => result,
                Err(_) => Err(Error::NoWriteQuorum),
            };
            this.on_replication_complete(lsn, result).await;
        });

        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, done_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::ObjectClosed),
                Err(_) => Err(Error::Timeout),
            },
            None => match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::ObjectClosed),
            },
        }
    }

    async fn on_replication_complete(&self, lsn: Lsn, result: CResult<Lsn>) {
        let should_flush = {
            let mut queue = lock(&self.inner.queue);
            if let Some(entry) = queue.queue.iter_mut().find(|e| e.lsn == lsn) {
                entry.replicated = true;
                entry.error = result.as_ref().err().cloned();
            }
            if result.is_ok() {
                queue.highest_completed = queue.highest_completed.max(lsn);
            }

            if queue.flushing {
                // Another task is already draining; it will pick this up.
                log::trace!("primary skip flush at lsn {}", lsn);
                false
            } else {
                queue.flushing = true;
                true
            }
        };

        if let Some(throttle) = lock(&self.inner.throttle).clone() {
            throttle.on_replication_completed();
        }

        if should_flush {
            self.drain_ready_commits().await;
        }
    }

    /// Drains the queue head while entries are observed complete, applying
    /// local commits in strict LSN order.
    async fn drain_ready_commits(&self) {
        let mut drain_error: Option<Error> = if lock(&self.inner.queue).faulted {
            Some(Error::NotPrimary)
        } else {
            None
        };

        loop {
            let batch = {
                let mut queue = lock(&self.inner.queue);
                let mut batch = Vec::new();
                while let Some(head) = queue.queue.front() {
                    let implied_complete = queue.highest_completed >= head.lsn;
                    if head.replicated || implied_complete {
                        batch.push(queue.queue.pop_front().expect("head exists"));
                    } else {
                        break;
                    }
                }
                if batch.is_empty() {
                    queue.flushing = false;
                }
                batch
            };

            if batch.is_empty() {
                break;
            }

            for entry in batch {
                self.apply_ready_commit(entry, &mut drain_error);
                tokio::task::yield_now().await;
            }
        }

        if self.inner.settings.enable_flush_on_drain && drain_error.is_none() {
            if let Err(err) = self.inner.store.flush() {
                log::error!("failed to flush commits: {}", err);
                self.fault(err);
            }
        }
    }

    fn apply_ready_commit(&self, mut entry: PendingCommit, drain_error: &mut Option<Error>) {
        let lsn = entry.lsn;
        let tx = entry.tx.take();

        let mut error = drain_error.clone().or_else(|| entry.error.take());

        let mut tombstones = 0;
        if error.is_none() {
            match tx {
                Some(tx) => match self.start_local_commit(tx, &entry.operations, lsn) {
                    Ok(count) => tombstones = count,
                    Err(err) => error = Some(err),
                },
                None => error = Some(Error::Internal("commit entry missing transaction".to_string())),
            }
        } else if let Some(tx) = tx {
            tx.rollback();
        }

        match error {
            None => {
                if tombstones > 0 {
                    if let Some(callback) = lock(&self.inner.on_tombstones_committed).clone() {
                        callback(tombstones);
                    }
                }
                if let Some(done) = entry.completion.take() {
                    let _ = done.send(Ok(lsn));
                }
            }
            Some(err) => {
                // Fail pending transactions gracefully on ObjectClosed.
                let err = match err {
                    Error::ObjectClosed => Error::NotPrimary,
                    other => other,
                };

                if !matches!(err, Error::NotPrimary) && drain_error.is_none() {
                    // Operations must persist in LSN order; once one local
                    // commit fails nothing later may be persisted.
                    log::error!("primary failed local commit at lsn {}: {}", lsn, err);
                    self.fault(err.clone());
                }
                *drain_error = Some(Error::NotPrimary);

                if let Some(done) = entry.completion.take() {
                    let _ = done.send(Err(err));
                }
            }
        }
    }

    /// Stamps the replicated LSN onto every affected row, finalizes deletes
    /// into tombstones, and commits the inner transaction. Returns the
    /// number of new tombstones.
    fn start_local_commit(
        &self,
        mut tx: StoreTransaction,
        operations: &[ReplicationOperation],
        lsn: Lsn,
    ) -> CResult<u64> {
        let mut tombstone_index = 0u64;
        let mut new_tombstones = 0u64;

        for op in operations {
            match op.kind {
                ReplicationOperationKind::Insert | ReplicationOperationKind::Update => {
                    let live_key = op.new_key.as_deref().unwrap_or(&op.key);
                    tx.update_lsn(&op.item_type, live_key, lsn)?;
                }
                ReplicationOperationKind::Delete => {
                    if tombstone::finalize_tombstone(
                        &mut tx,
                        &op.item_type,
                        &op.key,
                        lsn,
                        tombstone_index,
                    )? {
                        new_tombstones += 1;
                    }
                    tombstone_index += 1;
                }
                ReplicationOperationKind::Copy => {
                    return Err(Error::InvalidOperation(format!(
                        "unexpected {} operation on primary: type='{}' key='{}'",
                        op.kind, op.item_type, op.key
                    )));
                }
            }
        }

        let started = Instant::now();
        tx.commit()?;
        let elapsed = started.elapsed();

        if elapsed >= self.inner.settings.slow_commit_threshold() {
            log::warn!("primary slow commit at lsn {}: {:?}", lsn, elapsed);
            self.inner.health.on_slow_commit();
        } else {
            log::trace!("primary commit at lsn {}: {:?}", lsn, elapsed);
        }

        Ok(new_tombstones)
    }

    fn fault(&self, err: Error) {
        if let Error::StoreFatalError(detail) = &err {
            self.inner.health.report_fatal_error(detail);
        }
        lock(&self.inner.queue).faulted = true;
        self.inner.replicator.report_fault(FaultType::Transient);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
