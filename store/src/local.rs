//! Transactional `(type, key)` row storage on top of an ordered byte engine.
//!
//! Every row carries a monotonically assigned operation LSN and an optional
//! last-modified-on-primary timestamp. Transactions take an immutable
//! snapshot of the engine at begin time, buffer their writes, and publish
//! them atomically on commit. Row-level write conflicts are detected eagerly
//! through a shared write-intent table: the first transaction to touch a row
//! holds the intent until it commits or rolls back, and a concurrent writer
//! fails with `WriteConflict`.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::codec;
use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::{SnapshotMap, Status};

/// Operation sequence number assigned by the wire replicator.
pub type Lsn = i64;

/// Rows written before replication assigns their LSN carry this value.
pub const UNASSIGNED_LSN: Lsn = 0;

/// Metadata rows persist at this sentinel and never count as user progress.
const METADATA_LSN: Lsn = 1;

/// Shared handle to a replica's current local store; swapped wholesale when
/// a physical or snapshot build completes.
pub type SharedLocalStore = Arc<std::sync::RwLock<LocalStore>>;

/// A single materialized row.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreItem {
    pub item_type: String,
    pub key: String,
    pub value: Vec<u8>,
    pub operation_lsn: Lsn,
    pub last_modified_on_primary_utc: Option<DateTime<Utc>>,
}

/// Persisted row payload. The engine key is the encoded `(type, key)` pair;
/// everything else lives here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct RowValue {
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
    operation_lsn: Lsn,
    last_modified_on_primary_utc: Option<DateTime<Utc>>,
}

/// Encodes a `(type, key)` pair so that rows group by type and order by key
/// bytes within a type.
pub(crate) fn encode_row_key(item_type: &str, key: &str) -> Vec<u8> {
    let type_bytes = item_type.as_bytes();
    let mut out = Vec::with_capacity(4 + type_bytes.len() + key.len());
    out.extend_from_slice(&(type_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(type_bytes);
    out.extend_from_slice(key.as_bytes());
    out
}

pub(crate) fn decode_row_key(raw: &[u8]) -> CResult<(String, String)> {
    if raw.len() < 4 {
        return Err(Error::Parse("row key too short".to_string()));
    }
    let type_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + type_len {
        return Err(Error::Parse("row key truncated".to_string()));
    }
    let item_type = String::from_utf8(raw[4..4 + type_len].to_vec())?;
    let key = String::from_utf8(raw[4 + type_len..].to_vec())?;
    Ok((item_type, key))
}

/// Upper bound for a byte-prefix scan: the prefix with its last non-0xff
/// byte incremented, or unbounded if the prefix is all 0xff.
fn prefix_end(prefix: &[u8]) -> Bound<Vec<u8>> {
    match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => Bound::Excluded(
            prefix
                .iter()
                .take(i)
                .copied()
                .chain(std::iter::once(prefix[i] + 1))
                .collect(),
        ),
        None => Bound::Unbounded,
    }
}

struct StoreInner {
    engine: Mutex<Box<dyn Engine>>,
    /// Row key -> owning transaction id.
    intents: Mutex<HashMap<Vec<u8>, u64>>,
    last_commit_lsn: AtomicI64,
    next_tx_id: AtomicU64,
    closed: AtomicBool,
}

/// The per-replica local store. Cheap to clone; all clones share the same
/// engine and intent table.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Wraps an engine, replaying its contents to recover the last committed
    /// change LSN.
    pub fn open(mut engine: Box<dyn Engine>) -> CResult<Self> {
        let snapshot = engine.snapshot()?;
        let mut last_lsn = 0;
        for (_, raw) in snapshot.iter() {
            let row: RowValue = codec::deserialize(raw)?;
            if row.operation_lsn > METADATA_LSN && row.operation_lsn > last_lsn {
                last_lsn = row.operation_lsn;
            }
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                engine: Mutex::new(engine),
                intents: Mutex::new(HashMap::new()),
                last_commit_lsn: AtomicI64::new(last_lsn),
                next_tx_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Begins a snapshot transaction.
    pub fn create_transaction(&self) -> CResult<StoreTransaction> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ObjectClosed);
        }

        let snapshot = self.lock_engine().snapshot().map_err(fatal)?;
        let id = self.inner.next_tx_id.fetch_add(1, Ordering::SeqCst);
        Ok(StoreTransaction {
            store: self.clone(),
            id,
            snapshot,
            writes: BTreeMap::new(),
            held_intents: Vec::new(),
            max_written_lsn: 0,
            finished: false,
        })
    }

    /// Highest LSN committed into this store.
    pub fn last_change_operation_lsn(&self) -> Lsn {
        self.inner.last_commit_lsn.load(Ordering::SeqCst)
    }

    /// Durably syncs the engine.
    pub fn flush(&self) -> CResult<()> {
        self.lock_engine().flush().map_err(fatal)
    }

    /// Writes a compacted physical copy of the engine into `dir`.
    pub fn backup(&self, dir: &std::path::Path) -> CResult<()> {
        self.lock_engine().backup(dir).map_err(fatal)
    }

    pub fn status(&self) -> CResult<Status> {
        self.lock_engine().status()
    }

    /// Marks the store closed. In-flight transactions fail on commit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Copies every raw row of this store into `target`, replacing its
    /// contents. Used to seed a side store for snapshot partial builds.
    pub fn clone_contents_to(&self, target: &LocalStore) -> CResult<()> {
        let snapshot = self.lock_engine().snapshot().map_err(fatal)?;

        let mut target_engine = target.lock_engine();
        let existing = target_engine.snapshot().map_err(fatal)?;
        let mut writes: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            existing.keys().map(|k| (k.clone(), None)).collect();
        for (k, v) in snapshot.iter() {
            writes.push((k.clone(), Some(v.clone())));
        }
        target_engine.apply_batch(writes).map_err(fatal)?;
        drop(target_engine);

        target
            .inner
            .last_commit_lsn
            .store(self.last_change_operation_lsn(), Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn note_committed_lsn(&self, lsn: Lsn) {
        self.inner.last_commit_lsn.fetch_max(lsn, Ordering::SeqCst);
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, Box<dyn Engine>> {
        match self.inner.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn fatal(err: Error) -> Error {
    match err {
        Error::StoreFatalError(_) => err,
        other => Error::StoreFatalError(other.to_string()),
    }
}

/// A snapshot transaction over the local store.
///
/// Reads see the snapshot taken at begin time overlaid with the
/// transaction's own writes. Dropping the transaction without committing
/// rolls it back and releases its write intents.
pub struct StoreTransaction {
    store: LocalStore,
    id: u64,
    snapshot: SnapshotMap,
    /// Row key -> encoded row (None = delete).
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    held_intents: Vec<Vec<u8>>,
    max_written_lsn: Lsn,
    finished: bool,
}

impl StoreTransaction {
    /// Inserts a new row, failing with `RecordAlreadyExists` if present.
    pub fn insert(
        &mut self,
        item_type: &str,
        key: &str,
        value: &[u8],
        operation_lsn: Lsn,
        last_modified_on_primary_utc: Option<DateTime<Utc>>,
    ) -> CResult<()> {
        let row_key = encode_row_key(item_type, key);
        if self.view_get(&row_key).is_some() {
            return Err(Error::RecordAlreadyExists);
        }
        self.acquire_intent(&row_key)?;
        self.put_row(
            row_key,
            RowValue {
                value: value.to_vec(),
                operation_lsn,
                last_modified_on_primary_utc,
            },
        )
    }

    /// Updates an existing row, failing with `RecordNotFound` if missing and
    /// with `SequenceNumberCheckFailed` when `expected_lsn` is provided and
    /// differs from the stored LSN. A `new_key` moves the row.
    pub fn update(
        &mut self,
        item_type: &str,
        key: &str,
        expected_lsn: Option<Lsn>,
        new_key: Option<&str>,
        value: &[u8],
        operation_lsn: Lsn,
        last_modified_on_primary_utc: Option<DateTime<Utc>>,
    ) -> CResult<()> {
        let row_key = encode_row_key(item_type, key);
        let existing = match self.view_get(&row_key) {
            Some(raw) => codec::deserialize::<RowValue>(&raw)?,
            None => return Err(Error::RecordNotFound),
        };

        if let Some(expected) = expected_lsn {
            if expected != existing.operation_lsn {
                return Err(Error::SequenceNumberCheckFailed);
            }
        }

        self.acquire_intent(&row_key)?;

        let target_key = match new_key {
            Some(new_key) if new_key != key => {
                let target = encode_row_key(item_type, new_key);
                if self.view_get(&target).is_some() {
                    return Err(Error::RecordAlreadyExists);
                }
                self.acquire_intent(&target)?;
                self.writes.insert(row_key, None);
                target
            }
            _ => row_key,
        };

        self.put_row(
            target_key,
            RowValue {
                value: value.to_vec(),
                operation_lsn,
                last_modified_on_primary_utc,
            },
        )
    }

    /// Deletes a row, with an optional sequence-number check.
    pub fn delete(&mut self, item_type: &str, key: &str, expected_lsn: Option<Lsn>) -> CResult<()> {
        let row_key = encode_row_key(item_type, key);
        let existing = match self.view_get(&row_key) {
            Some(raw) => codec::deserialize::<RowValue>(&raw)?,
            None => return Err(Error::RecordNotFound),
        };

        if let Some(expected) = expected_lsn {
            if expected != existing.operation_lsn {
                return Err(Error::SequenceNumberCheckFailed);
            }
        }

        self.acquire_intent(&row_key)?;
        self.writes.insert(row_key, None);
        Ok(())
    }

    /// Stamps the committing LSN onto a row after replication assigns it.
    pub fn update_lsn(&mut self, item_type: &str, key: &str, new_lsn: Lsn) -> CResult<()> {
        let row_key = encode_row_key(item_type, key);
        let mut row = match self.view_get(&row_key) {
            Some(raw) => codec::deserialize::<RowValue>(&raw)?,
            None => return Err(Error::RecordNotFound),
        };

        self.acquire_intent(&row_key)?;
        row.operation_lsn = new_lsn;
        self.put_row(row_key, row)
    }

    /// Inserts or replaces a row unconditionally. Used for metadata rows and
    /// idempotent secondary applies.
    pub fn upsert(
        &mut self,
        item_type: &str,
        key: &str,
        value: &[u8],
        operation_lsn: Lsn,
        last_modified_on_primary_utc: Option<DateTime<Utc>>,
    ) -> CResult<()> {
        let row_key = encode_row_key(item_type, key);
        self.acquire_intent(&row_key)?;
        self.put_row(
            row_key,
            RowValue {
                value: value.to_vec(),
                operation_lsn,
                last_modified_on_primary_utc,
            },
        )
    }

    pub fn contains(&self, item_type: &str, key: &str) -> bool {
        self.view_get(&encode_row_key(item_type, key)).is_some()
    }

    pub fn get_operation_lsn(&self, item_type: &str, key: &str) -> CResult<Lsn> {
        match self.view_get(&encode_row_key(item_type, key)) {
            Some(raw) => Ok(codec::deserialize::<RowValue>(&raw)?.operation_lsn),
            None => Err(Error::RecordNotFound),
        }
    }

    /// Reads a row's value and LSN, failing with `RecordNotFound`.
    pub fn read_exact(&self, item_type: &str, key: &str) -> CResult<(Vec<u8>, Lsn)> {
        match self.view_get(&encode_row_key(item_type, key)) {
            Some(raw) => {
                let row = codec::deserialize::<RowValue>(&raw)?;
                Ok((row.value, row.operation_lsn))
            }
            None => Err(Error::RecordNotFound),
        }
    }

    pub fn read_item(&self, item_type: &str, key: &str) -> CResult<StoreItem> {
        match self.view_get(&encode_row_key(item_type, key)) {
            Some(raw) => {
                let row = codec::deserialize::<RowValue>(&raw)?;
                Ok(StoreItem {
                    item_type: item_type.to_string(),
                    key: key.to_string(),
                    value: row.value,
                    operation_lsn: row.operation_lsn,
                    last_modified_on_primary_utc: row.last_modified_on_primary_utc,
                })
            }
            None => Err(Error::RecordNotFound),
        }
    }

    /// Ordered scan restricted to `item_type`, starting at `key_prefix`.
    pub fn enumerate_by_type_and_key(
        &self,
        item_type: &str,
        key_prefix: &str,
    ) -> CResult<ItemEnumerator<'_>> {
        let type_prefix = encode_row_key(item_type, "");
        let start = encode_row_key(item_type, key_prefix);
        let end = prefix_end(&type_prefix);

        let mut items = Vec::new();
        for (row_key, raw) in self.view_range((Bound::Included(start), end)) {
            let (found_type, key) = decode_row_key(&row_key)?;
            debug_assert_eq!(found_type, item_type);
            let row: RowValue = codec::deserialize(&raw)?;
            items.push(StoreItem {
                item_type: found_type,
                key,
                value: row.value,
                operation_lsn: row.operation_lsn,
                last_modified_on_primary_utc: row.last_modified_on_primary_utc,
            });
        }

        Ok(ItemEnumerator { _tx: self, inner: items.into_iter() })
    }

    /// Scan in `(LSN, row key)` order from `start_lsn`.
    pub fn enumerate_by_operation_lsn(&self, start_lsn: Lsn) -> CResult<ItemEnumerator<'_>> {
        let mut items = Vec::new();
        for (row_key, raw) in self.view_range::<(Bound<Vec<u8>>, Bound<Vec<u8>>)>((
            Bound::Unbounded,
            Bound::Unbounded,
        )) {
            let row: RowValue = codec::deserialize(&raw)?;
            if row.operation_lsn < start_lsn {
                continue;
            }
            let (item_type, key) = decode_row_key(&row_key)?;
            items.push(StoreItem {
                item_type,
                key,
                value: row.value,
                operation_lsn: row.operation_lsn,
                last_modified_on_primary_utc: row.last_modified_on_primary_utc,
            });
        }
        items.sort_by(|a, b| {
            a.operation_lsn
                .cmp(&b.operation_lsn)
                .then_with(|| a.item_type.cmp(&b.item_type))
                .then_with(|| a.key.cmp(&b.key))
        });

        Ok(ItemEnumerator { _tx: self, inner: items.into_iter() })
    }

    pub fn last_change_operation_lsn(&self) -> Lsn {
        self.store.last_change_operation_lsn()
    }

    /// Atomically publishes the buffered writes.
    pub fn commit(mut self) -> CResult<()> {
        if self.store.is_closed() {
            self.release(false);
            return Err(Error::ObjectClosed);
        }

        let writes: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            std::mem::take(&mut self.writes).into_iter().collect();

        if !writes.is_empty() {
            self.store
                .lock_engine()
                .apply_batch(writes)
                .map_err(fatal)?;
        }

        if self.max_written_lsn > METADATA_LSN {
            self.store.note_committed_lsn(self.max_written_lsn);
        }

        self.release(true);
        Ok(())
    }

    /// Discards the buffered writes.
    pub fn rollback(mut self) {
        self.release(false);
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    fn put_row(&mut self, row_key: Vec<u8>, row: RowValue) -> CResult<()> {
        if row.operation_lsn > self.max_written_lsn {
            self.max_written_lsn = row.operation_lsn;
        }
        let raw = codec::serialize(&row)?;
        self.writes.insert(row_key, Some(raw));
        Ok(())
    }

    fn view_get(&self, row_key: &[u8]) -> Option<Vec<u8>> {
        match self.writes.get(row_key) {
            Some(Some(raw)) => Some(raw.clone()),
            Some(None) => None,
            None => self.snapshot.get(row_key).cloned(),
        }
    }

    /// Snapshot overlaid with buffered writes, over a key range.
    fn view_range<R>(&self, range: R) -> Vec<(Vec<u8>, Vec<u8>)>
    where
        R: std::ops::RangeBounds<Vec<u8>> + Clone,
    {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .snapshot
            .range(range.clone())
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for (k, v) in self.writes.range(range) {
            merged.insert(k.clone(), v.clone());
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    fn acquire_intent(&mut self, row_key: &[u8]) -> CResult<()> {
        let mut intents = match self.store.inner.intents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match intents.get(row_key) {
            Some(owner) if *owner == self.id => Ok(()),
            Some(_) => Err(Error::WriteConflict),
            None => {
                intents.insert(row_key.to_vec(), self.id);
                self.held_intents.push(row_key.to_vec());
                Ok(())
            }
        }
    }

    fn release(&mut self, _committed: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.held_intents.is_empty() {
            let mut intents = match self.store.inner.intents.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for row_key in self.held_intents.drain(..) {
                if intents.get(&row_key) == Some(&self.id) {
                    intents.remove(&row_key);
                }
            }
        }
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        // Dropping without commit is a rollback.
        self.release(false);
    }
}

/// An enumerator borrowing its transaction; it must be dropped before the
/// transaction finishes.
pub struct ItemEnumerator<'a> {
    _tx: &'a StoreTransaction,
    inner: std::vec::IntoIter<StoreItem>,
}

impl<'a> Iterator for ItemEnumerator<'a> {
    type Item = StoreItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::memory::Memory;

    fn open_store() -> LocalStore {
        LocalStore::open(Box::new(Memory::new())).unwrap()
    }

    #[test]
    fn insert_read_update_delete() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("T", "k1", b"v1", 5, None)?;
        tx.commit()?;
        assert_eq!(store.last_change_operation_lsn(), 5);

        let tx = store.create_transaction()?;
        assert_eq!(tx.read_exact("T", "k1")?, (b"v1".to_vec(), 5));
        assert_eq!(tx.get_operation_lsn("T", "k1")?, 5);
        tx.rollback();

        let mut tx = store.create_transaction()?;
        tx.update("T", "k1", Some(5), None, b"v2", 6, None)?;
        tx.commit()?;

        let mut tx = store.create_transaction()?;
        assert_eq!(tx.read_exact("T", "k1")?, (b"v2".to_vec(), 6));
        tx.delete("T", "k1", None)?;
        tx.commit()?;

        let tx = store.create_transaction()?;
        assert_eq!(tx.read_exact("T", "k1"), Err(Error::RecordNotFound));
        Ok(())
    }

    #[test]
    fn sequence_number_check() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("T", "k", b"v", 3, None)?;
        tx.commit()?;

        let mut tx = store.create_transaction()?;
        assert_eq!(
            tx.update("T", "k", Some(2), None, b"x", 4, None),
            Err(Error::SequenceNumberCheckFailed)
        );
        assert_eq!(tx.delete("T", "k", Some(9)), Err(Error::SequenceNumberCheckFailed));
        tx.rollback();
        Ok(())
    }

    #[test]
    fn duplicate_insert_rejected() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("T", "k", b"v", 1, None)?;
        tx.commit()?;

        let mut tx = store.create_transaction()?;
        assert_eq!(tx.insert("T", "k", b"v", 2, None), Err(Error::RecordAlreadyExists));
        tx.rollback();
        Ok(())
    }

    #[test]
    fn concurrent_writers_conflict() -> CResult<()> {
        let store = open_store();

        let mut tx1 = store.create_transaction()?;
        let mut tx2 = store.create_transaction()?;

        tx1.insert("T", "k", b"a", 1, None)?;
        assert_eq!(tx2.insert("T", "k", b"b", 2, None), Err(Error::WriteConflict));

        // Rolling back tx1 releases the intent for tx2's retry.
        tx1.rollback();
        let mut tx3 = store.create_transaction()?;
        tx3.insert("T", "k", b"b", 2, None)?;
        tx3.commit()?;
        drop(tx2);
        Ok(())
    }

    #[test]
    fn snapshot_isolation_within_transaction() -> CResult<()> {
        let store = open_store();

        let mut setup = store.create_transaction()?;
        setup.insert("T", "k", b"v0", 1, None)?;
        setup.commit()?;

        let reader = store.create_transaction()?;

        let mut writer = store.create_transaction()?;
        writer.update("T", "k", None, None, b"v1", 2, None)?;
        writer.commit()?;

        // The reader still sees the snapshot from its begin time.
        assert_eq!(reader.read_exact("T", "k")?, (b"v0".to_vec(), 1));
        reader.rollback();

        let fresh = store.create_transaction()?;
        assert_eq!(fresh.read_exact("T", "k")?, (b"v1".to_vec(), 2));
        Ok(())
    }

    #[test]
    fn enumerate_by_type_restricts_and_orders() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("A", "k2", b"2", 2, None)?;
        tx.insert("A", "k1", b"1", 1, None)?;
        tx.insert("B", "k0", b"0", 3, None)?;
        tx.commit()?;

        let tx = store.create_transaction()?;
        let keys: Vec<String> = tx
            .enumerate_by_type_and_key("A", "")?
            .map(|item| item.key)
            .collect();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);

        let from_k2: Vec<String> = tx
            .enumerate_by_type_and_key("A", "k2")?
            .map(|item| item.key)
            .collect();
        assert_eq!(from_k2, vec!["k2".to_string()]);
        Ok(())
    }

    #[test]
    fn enumerate_by_lsn_orders_and_filters() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("T", "a", b"", 7, None)?;
        tx.insert("T", "b", b"", 3, None)?;
        tx.insert("T", "c", b"", 7, None)?;
        tx.insert("U", "d", b"", 5, None)?;
        tx.commit()?;

        let tx = store.create_transaction()?;
        let seen: Vec<(String, Lsn)> = tx
            .enumerate_by_operation_lsn(5)?
            .map(|item| (item.key, item.operation_lsn))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("d".to_string(), 5),
                ("a".to_string(), 7),
                ("c".to_string(), 7),
            ]
        );
        Ok(())
    }

    #[test]
    fn update_with_new_key_moves_the_row() -> CResult<()> {
        let store = open_store();

        let mut tx = store.create_transaction()?;
        tx.insert("T", "old", b"v", 1, None)?;
        tx.commit()?;

        let mut tx = store.create_transaction()?;
        tx.update("T", "old", None, Some("new"), b"v2", 2, None)?;
        tx.commit()?;

        let tx = store.create_transaction()?;
        assert_eq!(tx.read_exact("T", "old"), Err(Error::RecordNotFound));
        assert_eq!(tx.read_exact("T", "new")?, (b"v2".to_vec(), 2));
        Ok(())
    }

    #[test]
    fn closed_store_rejects_new_transactions() -> CResult<()> {
        let store = open_store();
        store.close();
        assert!(matches!(store.create_transaction(), Err(Error::ObjectClosed)));
        Ok(())
    }
}
