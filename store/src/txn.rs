//! Primary-side transactions.
//!
//! A `Transaction` owns its local-store transaction and buffers the
//! replication operations describing its writes. Commit replicates the
//! buffered batch and completes once the quorum ack and the ordered local
//! commit both land; a read-only commit rolls the inner transaction back
//! since there is nothing to replicate.
//!
//! `SimpleTransactionGroup` coalesces many small transactions into one
//! replicated batch to amortize replication cost. Members share one inner
//! store transaction behind a lock; a duplicate `(type, key)` write across
//! members is a misuse and fails with `WriteConflict`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{CResult, Error};
use crate::local::{Lsn, StoreItem, StoreTransaction, UNASSIGNED_LSN};
use crate::replication::TransactionReplicator;
use crate::wire::ReplicationOperation;

/// Invoked exactly once when a transaction's lifetime ends, to feed the
/// replica state machine's transaction count.
pub type FinishCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Transaction {
    txr: TransactionReplicator,
    store_tx: Option<StoreTransaction>,
    operations: Vec<ReplicationOperation>,
    activity_id: Uuid,
    default_timeout: Option<Duration>,
    on_finish: Option<FinishCallback>,
}

impl Transaction {
    pub(crate) fn new(
        txr: TransactionReplicator,
        store_tx: StoreTransaction,
        default_timeout: Option<Duration>,
        on_finish: Option<FinishCallback>,
    ) -> Self {
        Transaction {
            txr,
            store_tx: Some(store_tx),
            operations: Vec::new(),
            activity_id: Uuid::new_v4(),
            default_timeout,
            on_finish,
        }
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn insert(&mut self, item_type: &str, key: &str, value: &[u8]) -> CResult<()> {
        let now = Utc::now();
        self.tx_mut()?
            .insert(item_type, key, value, UNASSIGNED_LSN, Some(now))?;

        let mut op = ReplicationOperation::insert(item_type, key, value.to_vec());
        op.last_modified_on_primary_utc = Some(now);
        self.operations.push(op);
        Ok(())
    }

    pub fn update(&mut self, item_type: &str, key: &str, value: &[u8]) -> CResult<()> {
        self.update_ex(item_type, key, None, None, value)
    }

    /// Update with an optional sequence-number check and key rename.
    pub fn update_ex(
        &mut self,
        item_type: &str,
        key: &str,
        expected_lsn: Option<Lsn>,
        new_key: Option<&str>,
        value: &[u8],
    ) -> CResult<()> {
        let now = Utc::now();
        self.tx_mut()?.update(
            item_type,
            key,
            expected_lsn,
            new_key,
            value,
            UNASSIGNED_LSN,
            Some(now),
        )?;

        let mut op = ReplicationOperation::update(item_type, key, new_key, value.to_vec());
        op.last_modified_on_primary_utc = Some(now);
        self.operations.push(op);
        Ok(())
    }

    pub fn delete(&mut self, item_type: &str, key: &str) -> CResult<()> {
        self.delete_ex(item_type, key, None)
    }

    /// Delete with an optional sequence-number check. Deleting a missing row
    /// without a check still replicates the delete so lagging peers drop it.
    pub fn delete_ex(
        &mut self,
        item_type: &str,
        key: &str,
        expected_lsn: Option<Lsn>,
    ) -> CResult<()> {
        match self.tx_mut()?.delete(item_type, key, expected_lsn) {
            Ok(()) => {}
            Err(Error::RecordNotFound) if expected_lsn.is_none() => {}
            Err(err) => return Err(err),
        }
        self.operations.push(ReplicationOperation::delete(item_type, key));
        Ok(())
    }

    pub fn read_exact(&self, item_type: &str, key: &str) -> CResult<(Vec<u8>, Lsn)> {
        self.tx_ref()?.read_exact(item_type, key)
    }

    pub fn get_operation_lsn(&self, item_type: &str, key: &str) -> CResult<Lsn> {
        self.tx_ref()?.get_operation_lsn(item_type, key)
    }

    pub fn enumerate_by_type_and_key(
        &self,
        item_type: &str,
        key_prefix: &str,
    ) -> CResult<Vec<StoreItem>> {
        Ok(self
            .tx_ref()?
            .enumerate_by_type_and_key(item_type, key_prefix)?
            .collect())
    }

    pub fn is_read_only(&self) -> bool {
        self.operations.is_empty()
    }

    /// Commits with the replica's default timeout.
    pub async fn commit(self) -> CResult<Lsn> {
        let timeout = self.default_timeout;
        self.commit_with(timeout).await
    }

    pub async fn commit_with(mut self, timeout: Option<Duration>) -> CResult<Lsn> {
        let store_tx = match self.store_tx.take() {
            Some(tx) => tx,
            None => return Err(Error::InvalidState("transaction already finished".to_string())),
        };
        let operations = std::mem::take(&mut self.operations);
        let on_finish = self.on_finish.take();

        let result = if operations.is_empty() {
            // Nothing to replicate; release the snapshot.
            let lsn = store_tx.last_change_operation_lsn();
            store_tx.rollback();
            Ok(lsn)
        } else {
            self.txr
                .replicate_commit(store_tx, operations, self.activity_id, timeout)
                .await
        };

        if let Some(on_finish) = on_finish {
            on_finish();
        }
        result
    }

    pub fn rollback(mut self) {
        if let Some(tx) = self.store_tx.take() {
            tx.rollback();
        }
        self.operations.clear();
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
    }

    fn tx_mut(&mut self) -> CResult<&mut StoreTransaction> {
        self.store_tx
            .as_mut()
            .ok_or_else(|| Error::InvalidState("transaction already finished".to_string()))
    }

    fn tx_ref(&self) -> CResult<&StoreTransaction> {
        self.store_tx
            .as_ref()
            .ok_or_else(|| Error::InvalidState("transaction already finished".to_string()))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An abandoned transaction rolls back and still reports finish.
        if let Some(tx) = self.store_tx.take() {
            tx.rollback();
        }
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
    }
}

struct GroupState {
    store_tx: Option<StoreTransaction>,
    operations: Vec<ReplicationOperation>,
    /// `(type, key)` -> writing member, for cross-member conflict detection.
    write_owners: HashMap<(String, String), u64>,
    size: usize,
    members: u64,
    committed: u64,
    next_member_id: u64,
    closed: bool,
    rolled_back: bool,
    committing: bool,
    result: Option<CResult<Lsn>>,
    waiters: Vec<oneshot::Sender<CResult<Lsn>>>,
}

struct GroupShared {
    txr: TransactionReplicator,
    activity_id: Uuid,
    size_limit: usize,
    state: Mutex<GroupState>,
}

/// A batch of simple transactions replicated as one atomic operation.
#[derive(Clone)]
pub struct SimpleTransactionGroup {
    shared: Arc<GroupShared>,
}

impl SimpleTransactionGroup {
    pub(crate) fn new(
        txr: TransactionReplicator,
        store_tx: StoreTransaction,
        size_limit: usize,
    ) -> Self {
        SimpleTransactionGroup {
            shared: Arc::new(GroupShared {
                txr,
                activity_id: Uuid::new_v4(),
                size_limit,
                state: Mutex::new(GroupState {
                    store_tx: Some(store_tx),
                    operations: Vec::new(),
                    write_owners: HashMap::new(),
                    size: 0,
                    members: 0,
                    committed: 0,
                    next_member_id: 1,
                    closed: false,
                    rolled_back: false,
                    committing: false,
                    result: None,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Adds a member. Fails once the group is sealed (size budget exceeded
    /// or already committing).
    pub fn create_simple_transaction(
        &self,
        on_finish: Option<FinishCallback>,
    ) -> CResult<SimpleTransaction> {
        let mut state = lock(&self.shared.state);
        if state.closed || state.rolled_back || state.committing {
            return Err(Error::ObjectClosed);
        }
        state.members += 1;
        let member_id = state.next_member_id;
        state.next_member_id += 1;
        Ok(SimpleTransaction {
            shared: self.shared.clone(),
            member_id,
            finished: false,
            on_finish,
        })
    }

    /// Seals the group against new members.
    pub fn close(&self) {
        lock(&self.shared.state).closed = true;
    }

    pub fn is_sealed(&self) -> bool {
        let state = lock(&self.shared.state);
        state.closed || state.rolled_back || state.committing
    }
}

/// One member of a simple transaction group.
pub struct SimpleTransaction {
    shared: Arc<GroupShared>,
    member_id: u64,
    finished: bool,
    on_finish: Option<FinishCallback>,
}

impl SimpleTransaction {
    pub fn insert(&mut self, item_type: &str, key: &str, value: &[u8]) -> CResult<()> {
        let now = Utc::now();
        let mut state = lock(&self.shared.state);
        Self::check_writable(&state)?;
        Self::claim_key(&mut state, self.member_id, item_type, key)?;

        state
            .store_tx
            .as_mut()
            .ok_or(Error::ObjectClosed)?
            .insert(item_type, key, value, UNASSIGNED_LSN, Some(now))?;

        let mut op = ReplicationOperation::insert(item_type, key, value.to_vec());
        op.last_modified_on_primary_utc = Some(now);
        state.size += op.approximate_size();
        state.operations.push(op);
        Self::seal_if_over_budget(&mut state, self.shared.size_limit);
        Ok(())
    }

    pub fn update(&mut self, item_type: &str, key: &str, value: &[u8]) -> CResult<()> {
        let now = Utc::now();
        let mut state = lock(&self.shared.state);
        Self::check_writable(&state)?;
        Self::claim_key(&mut state, self.member_id, item_type, key)?;

        state.store_tx.as_mut().ok_or(Error::ObjectClosed)?.update(
            item_type,
            key,
            None,
            None,
            value,
            UNASSIGNED_LSN,
            Some(now),
        )?;

        let mut op = ReplicationOperation::update(item_type, key, None, value.to_vec());
        op.last_modified_on_primary_utc = Some(now);
        state.size += op.approximate_size();
        state.operations.push(op);
        Self::seal_if_over_budget(&mut state, self.shared.size_limit);
        Ok(())
    }

    pub fn delete(&mut self, item_type: &str, key: &str) -> CResult<()> {
        let mut state = lock(&self.shared.state);
        Self::check_writable(&state)?;
        Self::claim_key(&mut state, self.member_id, item_type, key)?;

        match state
            .store_tx
            .as_mut()
            .ok_or(Error::ObjectClosed)?
            .delete(item_type, key, None)
        {
            Ok(()) | Err(Error::RecordNotFound) => {}
            Err(err) => return Err(err),
        }

        let op = ReplicationOperation::delete(item_type, key);
        state.size += op.approximate_size();
        state.operations.push(op);
        Self::seal_if_over_budget(&mut state, self.shared.size_limit);
        Ok(())
    }

    /// Registers this member's commit. The group replicates once every
    /// member has committed; all members observe the same outcome.
    pub async fn commit(mut self) -> CResult<Lsn> {
        self.finished = true;

        let (ready, rx) = {
            let mut state = lock(&self.shared.state);
            if state.rolled_back {
                drop(state);
                self.fire_finish();
                return Err(Error::ObjectClosed);
            }
            if let Some(result) = &state.result {
                let result = result.clone();
                drop(state);
                self.fire_finish();
                return result;
            }

            state.committed += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);

            let ready = state.committed >= state.members && !state.committing;
            if ready {
                state.committing = true;
                state.closed = true;
            }
            (ready, rx)
        };

        if ready {
            let (store_tx, operations) = {
                let mut state = lock(&self.shared.state);
                (state.store_tx.take(), std::mem::take(&mut state.operations))
            };

            let result = match store_tx {
                Some(store_tx) if !operations.is_empty() => {
                    self.shared
                        .txr
                        .replicate_commit(store_tx, operations, self.shared.activity_id, None)
                        .await
                }
                Some(store_tx) => {
                    let lsn = store_tx.last_change_operation_lsn();
                    store_tx.rollback();
                    Ok(lsn)
                }
                None => Err(Error::ObjectClosed),
            };

            let mut state = lock(&self.shared.state);
            state.result = Some(result.clone());
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(result.clone());
            }
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ObjectClosed),
        };
        self.fire_finish();
        result
    }

    /// Rolls back the whole group: members share one inner transaction, so
    /// one member's rollback discards every buffered write.
    pub fn rollback(mut self) {
        self.finished = true;
        let waiters = {
            let mut state = lock(&self.shared.state);
            state.rolled_back = true;
            state.closed = true;
            if let Some(tx) = state.store_tx.take() {
                tx.rollback();
            }
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(Error::ObjectClosed));
        }
        self.fire_finish();
    }

    fn check_writable(state: &GroupState) -> CResult<()> {
        if state.rolled_back || state.committing {
            return Err(Error::ObjectClosed);
        }
        Ok(())
    }

    fn claim_key(
        state: &mut GroupState,
        member_id: u64,
        item_type: &str,
        key: &str,
    ) -> CResult<()> {
        let pair = (item_type.to_string(), key.to_string());
        match state.write_owners.get(&pair) {
            Some(owner) if *owner != member_id => Err(Error::WriteConflict),
            Some(_) => Ok(()),
            None => {
                state.write_owners.insert(pair, member_id);
                Ok(())
            }
        }
    }

    fn seal_if_over_budget(state: &mut GroupState, limit: usize) {
        if limit > 0 && state.size > limit && !state.closed {
            log::info!("simple transaction group sealed at {} bytes", state.size);
            state.closed = true;
        }
    }

    fn fire_finish(&mut self) {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
    }
}

impl Drop for SimpleTransaction {
    fn drop(&mut self) {
        if !self.finished {
            // An abandoned member counts as committed with no further
            // writes, so the rest of the group is not stranded.
            let mut state = lock(&self.shared.state);
            state.committed += 1;
            drop(state);
            self.fire_finish();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
