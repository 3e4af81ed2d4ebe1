//! The secondary apply pipeline.
//!
//! The pump drains the copy stream, then the replication stream, applying
//! each decoded batch idempotently in its own local transaction and acking
//! only after the local commit completes. Retryable conflicts re-apply in a
//! fresh transaction; anything else faults the stream, which keeps draining
//! buffered operations (acked, unapplied) so the wire replicator accepts the
//! subsequent transient-fault request, and then the pump closes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::StoreSettings;
use crate::error::{CResult, Error};
use crate::file_stream;
use crate::local::{LocalStore, Lsn, SharedLocalStore, StoreItem, StoreTransaction};
use crate::notify::NotificationManager;
use crate::progress::{
    self, CurrentEpochData, Epoch, PartialCopyProgressData, ProgressVectorData,
    TombstoneLowWatermarkData,
};
use crate::replicator::{FaultType, InboundOperation, OperationStream, StateReplicator};
use crate::storage::engine::EngineFactory;
use crate::tombstone::{self, TOMBSTONE_DATA_TYPE};
use crate::wire::{
    AtomicOperation, CopyOperation, CopyType, ReplicationOperation, ReplicationOperationKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpState {
    NotStarted,
    Copy,
    Replication,
    Closed,
}

struct CopyApplyState {
    /// Side store for snapshot partial builds and full rebuilds (paired
    /// with its directory); swapped in at end of copy.
    replacement: Option<(LocalStore, PathBuf)>,
    /// Archive assembly for file-stream builds.
    archive: Option<(std::fs::File, PathBuf)>,
    staging_sequence: u64,
}

struct PumpInner {
    settings: StoreSettings,
    replicator: Arc<dyn StateReplicator>,
    shared_store: SharedLocalStore,
    engine_factory: EngineFactory,
    data_dir: PathBuf,
    staging_root: PathBuf,
    notifications: Arc<NotificationManager>,
    cached_epoch: Arc<Mutex<Option<Epoch>>>,
    state: Mutex<PumpState>,
    /// `(type, key)` -> highest uncommitted insert LSN, consulted when a
    /// delete misses, to tell a genuine no-op from an insert the delete
    /// transaction cannot see yet.
    pending_inserts: Mutex<HashMap<(String, String), Lsn>>,
    copy: Mutex<CopyApplyState>,
    streams: Mutex<Vec<Arc<OperationStream>>>,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send + Sync>>>,
    faulted: AtomicBool,
    applied_batches: AtomicU64,
}

#[derive(Clone)]
pub struct SecondaryPump {
    inner: Arc<PumpInner>,
}

impl SecondaryPump {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: StoreSettings,
        replicator: Arc<dyn StateReplicator>,
        shared_store: SharedLocalStore,
        engine_factory: EngineFactory,
        data_dir: PathBuf,
        notifications: Arc<NotificationManager>,
        cached_epoch: Arc<Mutex<Option<Epoch>>>,
        on_closed: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        let staging_root = data_dir.join("staging");
        SecondaryPump {
            inner: Arc::new(PumpInner {
                settings,
                replicator,
                shared_store,
                engine_factory,
                data_dir,
                staging_root,
                notifications,
                cached_epoch,
                state: Mutex::new(PumpState::NotStarted),
                pending_inserts: Mutex::new(HashMap::new()),
                copy: Mutex::new(CopyApplyState {
                    replacement: None,
                    archive: None,
                    staging_sequence: 0,
                }),
                streams: Mutex::new(Vec::new()),
                on_closed: Mutex::new(Some(on_closed)),
                faulted: AtomicBool::new(false),
                applied_batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> PumpState {
        *lock(&self.inner.state)
    }

    pub fn applied_batches(&self) -> u64 {
        self.inner.applied_batches.load(Ordering::SeqCst)
    }

    /// Starts pumping on the runtime. Idempotent close: the task fires the
    /// closed callback exactly once.
    pub fn start(&self) {
        let pump = self.clone();
        tokio::spawn(async move { pump.run().await });
    }

    /// Cooperative cancel: faults the streams so the pump drains whatever is
    /// buffered and terminates.
    pub fn cancel(&self) {
        self.inner.faulted.store(true, Ordering::SeqCst);
        for stream in lock(&self.inner.streams).iter() {
            stream.report_fault();
        }
    }

    async fn run(self) {
        *lock(&self.inner.state) = PumpState::Copy;

        let copy_stream = match self.inner.replicator.get_copy_stream() {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                log::error!("secondary failed to get copy stream: {}", err);
                self.fault_replica();
                self.close();
                return;
            }
        };
        lock(&self.inner.streams).push(copy_stream.clone());
        // A cancel that raced stream registration still drains.
        if self.inner.faulted.load(Ordering::SeqCst) {
            copy_stream.report_fault();
        }

        if self.pump_copy_stream(&copy_stream).await {
            *lock(&self.inner.state) = PumpState::Replication;

            let replication_stream = match self.inner.replicator.get_replication_stream() {
                Ok(stream) => Arc::new(stream),
                Err(err) => {
                    log::error!("secondary failed to get replication stream: {}", err);
                    self.fault_replica();
                    self.close();
                    return;
                }
            };
            lock(&self.inner.streams).push(replication_stream.clone());
            if self.inner.faulted.load(Ordering::SeqCst) {
                replication_stream.report_fault();
            }

            self.pump_replication_stream(&replication_stream).await;
        }

        self.close();
    }

    /// Returns true when the copy stream completed normally and the pump
    /// should move on to the replication stream.
    async fn pump_copy_stream(&self, stream: &OperationStream) -> bool {
        loop {
            let op = match stream.get_operation().await {
                Ok(Some(op)) => op,
                Ok(None) => return false,
                Err(err) => {
                    log::error!("secondary copy pump error: {}", err);
                    self.fault_stream(stream);
                    return false;
                }
            };

            if op.is_end_of_stream() {
                if self.inner.faulted.load(Ordering::SeqCst) {
                    op.ack();
                    return false;
                }
                let result = self.process_end_of_copy_stream();
                // EOS is acked even if local processing failed, otherwise
                // the replicator refuses the transient-fault request.
                op.ack();
                match result {
                    Ok(()) => return !self.inner.faulted.load(Ordering::SeqCst),
                    Err(err) => {
                        log::error!("secondary failed to finish copy: {}", err);
                        self.fault_replica();
                        return false;
                    }
                }
            }

            if self.inner.faulted.load(Ordering::SeqCst) {
                op.ack();
                continue;
            }

            match self.process_copy_operation(&op).await {
                Ok(()) => op.ack(),
                Err(err) => {
                    log::error!("secondary failed to apply copy operation: {}", err);
                    self.fault_stream(stream);
                }
            }
        }
    }

    async fn pump_replication_stream(&self, stream: &OperationStream) {
        loop {
            let op = match stream.get_operation().await {
                Ok(Some(op)) => op,
                Ok(None) => return,
                Err(err) => {
                    log::error!("secondary replication pump error: {}", err);
                    self.fault_stream(stream);
                    return;
                }
            };

            if op.is_end_of_stream() {
                op.ack();
                return;
            }

            if self.inner.faulted.load(Ordering::SeqCst) {
                op.ack();
                continue;
            }

            match self.process_replication_operation(&op).await {
                Ok(()) => op.ack(),
                Err(err) => {
                    log::error!(
                        "secondary failed to apply replication operation at lsn {}: {}",
                        op.lsn,
                        err
                    );
                    self.fault_stream(stream);
                }
            }
        }
    }

    async fn process_replication_operation(&self, op: &InboundOperation) -> CResult<()> {
        let payload = op
            .payload()
            .ok_or_else(|| Error::Internal("missing payload".to_string()))?;
        let atomic = AtomicOperation::decode(payload)?;

        let store = self.current_store();
        let items = self
            .apply_operations_with_retry(&store, &atomic.operations, false)
            .await?;

        // In blocking mode a handler failure transient-faults the replica
        // before the ack.
        self.inner
            .notifications
            .on_batch_applied(op.lsn, items)?;
        self.inner.applied_batches.fetch_add(1, Ordering::SeqCst);
        self.inner
            .notifications
            .on_quorum_advanced(atomic.last_quorum_acked_lsn);
        Ok(())
    }

    async fn process_copy_operation(&self, op: &InboundOperation) -> CResult<()> {
        let payload = op
            .payload()
            .ok_or_else(|| Error::Internal("missing payload".to_string()))?;
        let copy_op = CopyOperation::decode(payload)?;

        match copy_op.copy_type() {
            CopyType::FirstFullCopy => {
                // Full copy starts from nothing: build a fresh store on the
                // side and swap at end of copy.
                self.create_replacement_store(false)?;
                self.apply_copy_operations(&copy_op).await
            }
            CopyType::FirstPartialCopy => self.apply_copy_operations(&copy_op).await,
            CopyType::FirstSnapshotPartialCopy => {
                // The incremental build pages across transactions, so it
                // lands on a snapshot of the current store and only swaps in
                // on completion.
                self.create_replacement_store(true)?;
                self.record_partial_copy_progress(&copy_op)?;
                self.apply_copy_operations(&copy_op).await
            }
            CopyType::PagedCopy => self.apply_copy_operations(&copy_op).await,
            CopyType::FileStreamFullCopy | CopyType::FileStreamRebuildCopy => {
                self.apply_file_stream_operation(&copy_op)
            }
        }
    }

    async fn apply_copy_operations(&self, copy_op: &CopyOperation) -> CResult<()> {
        if copy_op.operations.is_empty() {
            return Ok(());
        }
        let store = self.copy_target_store();
        self.apply_operations_with_retry(&store, &copy_op.operations, true)
            .await?;
        Ok(())
    }

    /// Applies one batch with bounded retries in fresh transactions for
    /// retryable conflicts.
    async fn apply_operations_with_retry(
        &self,
        store: &LocalStore,
        operations: &[ReplicationOperation],
        is_copy: bool,
    ) -> CResult<Vec<StoreItem>> {
        let mut attempt = 0;
        loop {
            match self.apply_operations(store, operations, is_copy) {
                Ok(items) => return Ok(items),
                Err(err)
                    if err.is_retryable_apply()
                        && attempt < self.inner.settings.secondary_apply_retry_count =>
                {
                    attempt += 1;
                    let base = self.inner.settings.secondary_apply_retry_delay_ms;
                    let jitter = rand::random::<u64>() % (base / 2 + 1);
                    log::info!(
                        "secondary retrying batch apply (attempt {}): {}",
                        attempt,
                        err
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_operations(
        &self,
        store: &LocalStore,
        operations: &[ReplicationOperation],
        is_copy: bool,
    ) -> CResult<Vec<StoreItem>> {
        let mut tx = store.create_transaction()?;
        let mut applied = Vec::new();
        let mut inserted_keys: Vec<(String, String, Lsn)> = Vec::new();
        let mut tombstone_index = 0u64;

        for op in operations {
            match op.kind {
                ReplicationOperationKind::Insert => {
                    self.insert_or_update(&mut tx, op, &mut inserted_keys)?;
                    applied.push(Self::to_item(op));
                }
                ReplicationOperationKind::Update => {
                    self.update_or_insert(&mut tx, op, &mut inserted_keys)?;
                    applied.push(Self::to_item(op));
                }
                ReplicationOperationKind::Delete => {
                    self.delete_if_data_item_exists(&mut tx, op, tombstone_index)?;
                    tombstone_index += 1;
                }
                ReplicationOperationKind::Copy => {
                    if is_copy {
                        self.apply_copy_row(&mut tx, op)?;
                        applied.push(Self::to_item(op));
                    } else {
                        return Err(Error::InvalidOperation(format!(
                            "copy operation on replication stream: type='{}' key='{}'",
                            op.item_type, op.key
                        )));
                    }
                }
            }
        }

        tx.commit()?;

        // Inserts become visible on commit, so their pending markers can go.
        if !inserted_keys.is_empty() {
            let mut pending = lock(&self.inner.pending_inserts);
            for (item_type, key, lsn) in inserted_keys {
                if let Some(existing) = pending.get(&(item_type.clone(), key.clone())) {
                    if *existing <= lsn {
                        pending.remove(&(item_type, key));
                    }
                }
            }
        }

        Ok(applied)
    }

    fn insert_or_update(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
        inserted: &mut Vec<(String, String, Lsn)>,
    ) -> CResult<()> {
        match tx.insert(
            &op.item_type,
            &op.key,
            &op.bytes,
            op.operation_lsn,
            op.last_modified_on_primary_utc,
        ) {
            Ok(()) => {
                self.add_pending_insert(&op.item_type, &op.key, op.operation_lsn);
                inserted.push((op.item_type.clone(), op.key.clone(), op.operation_lsn));
                Ok(())
            }
            Err(Error::RecordAlreadyExists) => {
                let current = tx.get_operation_lsn(&op.item_type, &op.key)?;
                self.do_update(tx, op, current)
            }
            Err(err) => Err(err),
        }
    }

    fn update_or_insert(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
        inserted: &mut Vec<(String, String, Lsn)>,
    ) -> CResult<()> {
        match tx.get_operation_lsn(&op.item_type, &op.key) {
            Ok(current) => self.do_update(tx, op, current),
            Err(Error::RecordNotFound) => {
                tx.insert(
                    &op.item_type,
                    &op.key,
                    &op.bytes,
                    op.operation_lsn,
                    op.last_modified_on_primary_utc,
                )?;
                self.add_pending_insert(&op.item_type, &op.key, op.operation_lsn);
                inserted.push((op.item_type.clone(), op.key.clone(), op.operation_lsn));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn do_update(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
        current_lsn: Lsn,
    ) -> CResult<()> {
        if op.operation_lsn >= current_lsn {
            tx.update(
                &op.item_type,
                &op.key,
                None,
                op.new_key.as_deref(),
                &op.bytes,
                op.operation_lsn,
                op.last_modified_on_primary_utc,
            )
        } else {
            // A full build can include newer state than buffered replication
            // operations that replay behind it; those older writes no-op.
            log::info!(
                "secondary ignored update: type='{}' key='{}' lsn=(incoming={} existing={})",
                op.item_type,
                op.key,
                op.operation_lsn,
                current_lsn
            );
            Ok(())
        }
    }

    fn delete_if_data_item_exists(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
        tombstone_index: u64,
    ) -> CResult<()> {
        match tx.get_operation_lsn(&op.item_type, &op.key) {
            Ok(current) => {
                if op.operation_lsn > 0 && op.operation_lsn < current {
                    // A live entry re-inserted past the delete; drop it.
                    log::info!(
                        "secondary no-op delete for higher lsn entry: type='{}' key='{}' lsn=(delete={} existing={})",
                        op.item_type,
                        op.key,
                        op.operation_lsn,
                        current
                    );
                    return Ok(());
                }
                tx.delete(&op.item_type, &op.key, None)?;
                tombstone::finalize_tombstone(
                    tx,
                    &op.item_type,
                    &op.key,
                    op.operation_lsn,
                    tombstone_index,
                )?;
                Ok(())
            }
            Err(Error::RecordNotFound) => {
                let pending = lock(&self.inner.pending_inserts)
                    .get(&(op.item_type.clone(), op.key.clone()))
                    .copied();
                match pending {
                    Some(pending_lsn) if pending_lsn < op.operation_lsn => {
                        // An uncommitted insert this transaction cannot see:
                        // retrying in a fresh transaction breaks the race.
                        log::info!(
                            "secondary blocking delete on pending insert: type='{}' key='{}' lsn={} pending={}",
                            op.item_type,
                            op.key,
                            op.operation_lsn,
                            pending_lsn
                        );
                        Err(Error::WriteConflict)
                    }
                    _ => {
                        log::info!(
                            "secondary no-op delete for non-existent entry: type='{}' key='{}' lsn={}",
                            op.item_type,
                            op.key,
                            op.operation_lsn
                        );
                        Ok(())
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Routes special rows arriving on the copy stream to their metadata
    /// handlers; everything else is idempotent user data.
    fn apply_copy_row(&self, tx: &mut StoreTransaction, op: &ReplicationOperation) -> CResult<()> {
        if op.item_type == progress::PROGRESS_DATA_TYPE {
            return match op.key.as_str() {
                progress::CURRENT_EPOCH_KEY => self.process_epoch_update(tx, op),
                progress::EPOCH_HISTORY_KEY => self.process_epoch_history(tx, op),
                progress::TOMBSTONE_LOW_WATERMARK_KEY => {
                    self.process_tombstone_low_watermark(tx, op)
                }
                other => Err(Error::InvalidOperation(format!(
                    "unrecognized progress row '{}' in copy stream",
                    other
                ))),
            };
        }

        if op.item_type == TOMBSTONE_DATA_TYPE {
            return self.process_tombstone(tx, op);
        }

        let mut inserted = Vec::new();
        self.insert_or_update(tx, op, &mut inserted)
    }

    fn process_epoch_update(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
    ) -> CResult<()> {
        let data: CurrentEpochData = crate::codec::deserialize(&op.bytes)?;
        progress::write_current_epoch(tx, &data)?;
        *lock(&self.inner.cached_epoch) = Some(data.epoch);
        log::info!("secondary installed copied epoch {}", data.epoch);
        Ok(())
    }

    fn process_epoch_history(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
    ) -> CResult<()> {
        // The history is replaced wholesale; it cannot be rebuilt from the
        // streamed epoch updates alone.
        let data: ProgressVectorData = crate::codec::deserialize(&op.bytes)?;
        progress::write_epoch_history(tx, &data)
    }

    fn process_tombstone_low_watermark(
        &self,
        tx: &mut StoreTransaction,
        op: &ReplicationOperation,
    ) -> CResult<()> {
        let data: TombstoneLowWatermarkData = crate::codec::deserialize(&op.bytes)?;
        progress::write_low_watermark(tx, &data)
    }

    fn process_tombstone(&self, tx: &mut StoreTransaction, op: &ReplicationOperation) -> CResult<()> {
        let data = tombstone::decode_copied_tombstone(&op.key, &op.bytes, op.operation_lsn)?;
        tombstone::finalize_tombstone(
            tx,
            &data.live_entry_type,
            &data.live_entry_key,
            data.operation_lsn,
            data.index,
        )?;
        // The copied tombstone also deletes any live row it supersedes.
        match tx.get_operation_lsn(&data.live_entry_type, &data.live_entry_key) {
            Ok(current) if current <= data.operation_lsn => {
                tx.delete(&data.live_entry_type, &data.live_entry_key, None)
            }
            Ok(_) | Err(Error::RecordNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn apply_file_stream_operation(&self, copy_op: &CopyOperation) -> CResult<()> {
        let data = copy_op
            .file_stream_data
            .as_ref()
            .ok_or_else(|| Error::Parse("file stream page without chunk data".to_string()))?;

        let mut copy = lock(&self.inner.copy);

        if data.is_first_chunk || copy.archive.is_none() {
            copy.staging_sequence += 1;
            let path = self
                .inner
                .staging_root
                .join(format!("incoming-{}.bkar", copy.staging_sequence));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::File::create(&path)?;
            copy.archive = Some((file, path));
        }

        {
            let (file, _) = copy.archive.as_mut().expect("archive initialized");
            use std::io::Write;
            file.write_all(&data.bytes)?;
        }

        if data.is_last_chunk {
            let (file, path) = copy.archive.take().expect("archive initialized");
            file.sync_all()?;

            copy.staging_sequence += 1;
            let extract_dir = self
                .inner
                .staging_root
                .join(format!("rebuild-{}", copy.staging_sequence));
            file_stream::extract_archive(&path, &extract_dir)?;
            std::fs::remove_file(&path)?;

            let staged_bytes = fs_extra::dir::get_size(&extract_dir).unwrap_or(0);
            let engine = (self.inner.engine_factory)(&extract_dir)?;
            let rebuilt = LocalStore::open(engine)?;
            log::info!(
                "secondary rebuilt store from file stream copy at lsn {} ({} bytes staged)",
                rebuilt.last_change_operation_lsn(),
                staged_bytes
            );
            copy.replacement = Some((rebuilt, extract_dir));
        }

        Ok(())
    }

    /// Marks where the snapshot partial build started so an interrupted
    /// build can resume.
    fn record_partial_copy_progress(&self, copy_op: &CopyOperation) -> CResult<()> {
        let start_lsn = copy_op
            .operations
            .iter()
            .filter(|op| !progress::is_metadata_type(&op.item_type))
            .map(|op| op.operation_lsn)
            .min();
        let start_lsn = match start_lsn {
            Some(lsn) => lsn,
            None => return Ok(()),
        };

        let store = self.copy_target_store();
        let mut tx = store.create_transaction()?;
        progress::write_partial_copy_progress(
            &mut tx,
            &PartialCopyProgressData { last_start_lsn: start_lsn },
        )?;
        tx.commit()
    }

    fn process_end_of_copy_stream(&self) -> CResult<()> {
        let replacement = lock(&self.inner.copy).replacement.take();

        let target = match replacement {
            Some((replacement, dir)) => {
                // Swap the rebuilt or side store in and repoint CURRENT so a
                // restart finds it, before reporting the copy complete.
                if let Ok(relative) = dir.strip_prefix(&self.inner.data_dir) {
                    crate::storage::write_current_store_dir(
                        &self.inner.data_dir,
                        &relative.to_string_lossy(),
                    )?;
                }
                let mut shared = match self.inner.shared_store.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *shared = replacement.clone();
                drop(shared);
                replacement
            }
            None => self.current_store(),
        };

        let mut tx = target.create_transaction()?;
        let recovered = tombstone::recover_tombstones(&mut tx)?;
        if recovered > 0 {
            log::info!("secondary recovered {} copied tombstones", recovered);
        }
        progress::clear_partial_copy_progress(&mut tx)?;
        tx.commit()?;
        target.flush()?;

        let items: Vec<StoreItem> = {
            let tx = target.create_transaction()?;
            let mut items = Vec::new();
            for item in tx.enumerate_by_operation_lsn(0)? {
                if progress::is_metadata_type(&item.item_type)
                    || item.item_type == TOMBSTONE_DATA_TYPE
                {
                    continue;
                }
                items.push(item);
            }
            items
        };

        log::info!(
            "secondary copy complete: {} user rows at lsn {}",
            items.len(),
            target.last_change_operation_lsn()
        );
        self.inner.notifications.notify_copy_complete(items)
    }

    fn create_replacement_store(&self, seed_from_current: bool) -> CResult<()> {
        let mut copy = lock(&self.inner.copy);
        if copy.replacement.is_some() {
            return Ok(());
        }

        copy.staging_sequence += 1;
        let staging = self
            .inner
            .staging_root
            .join(format!("build-{}", copy.staging_sequence));
        std::fs::create_dir_all(&staging)?;

        let engine = (self.inner.engine_factory)(&staging)?;
        let store = LocalStore::open(engine)?;
        if seed_from_current {
            self.current_store().clone_contents_to(&store)?;
        }
        copy.replacement = Some((store, staging));
        Ok(())
    }

    fn add_pending_insert(&self, item_type: &str, key: &str, lsn: Lsn) {
        let mut pending = lock(&self.inner.pending_inserts);
        let entry = pending
            .entry((item_type.to_string(), key.to_string()))
            .or_insert(lsn);
        // Only the highest-LSN pending insert is kept per key.
        if *entry < lsn {
            *entry = lsn;
        }
    }

    fn current_store(&self) -> LocalStore {
        match self.inner.shared_store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn copy_target_store(&self) -> LocalStore {
        if let Some((replacement, _)) = &lock(&self.inner.copy).replacement {
            return replacement.clone();
        }
        self.current_store()
    }

    fn fault_stream(&self, stream: &OperationStream) {
        if !self.inner.faulted.swap(true, Ordering::SeqCst) {
            stream.report_fault();
            self.inner.replicator.report_fault(FaultType::Transient);
        }
    }

    fn fault_replica(&self) {
        if !self.inner.faulted.swap(true, Ordering::SeqCst) {
            self.inner.replicator.report_fault(FaultType::Transient);
        }
    }

    fn close(&self) {
        *lock(&self.inner.state) = PumpState::Closed;
        if let Some(on_closed) = lock(&self.inner.on_closed).take() {
            on_closed();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SecondaryPump {
    fn to_item(op: &ReplicationOperation) -> StoreItem {
        StoreItem {
            item_type: op.item_type.clone(),
            key: op.new_key.clone().unwrap_or_else(|| op.key.clone()),
            value: op.bytes.clone(),
            operation_lsn: op.operation_lsn,
            last_modified_on_primary_utc: op.last_modified_on_primary_utc,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::notify::NotificationMode;
    use crate::replicator::loopback::LoopbackReplicator;
    use crate::storage::memory::Memory;

    fn memory_factory() -> EngineFactory {
        Arc::new(|_dir: &std::path::Path| {
            Ok(Box::new(Memory::new()) as Box<dyn crate::storage::engine::Engine>)
        })
    }

    struct Harness {
        pump: SecondaryPump,
        shared: SharedLocalStore,
        control: crate::replicator::loopback::SecondaryControl,
        secondary: crate::replicator::loopback::LoopbackSecondary,
        closed: Arc<AtomicBool>,
        _staging: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let primary = LoopbackReplicator::new(0, 1);
        let (secondary, control) = primary.attach_secondary();

        let store = LocalStore::open(Box::new(Memory::new())).unwrap();
        let shared: SharedLocalStore = Arc::new(std::sync::RwLock::new(store));
        let staging = tempfile::tempdir().unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();

        let pump = SecondaryPump::new(
            StoreSettings {
                secondary_apply_retry_count: 2,
                secondary_apply_retry_delay_ms: 5,
                ..StoreSettings::default()
            },
            Arc::new(secondary.clone()),
            shared.clone(),
            memory_factory(),
            staging.path().to_path_buf(),
            NotificationManager::new(NotificationMode::None, None),
            Arc::new(Mutex::new(None)),
            Box::new(move || {
                closed_flag.store(true, Ordering::SeqCst);
            }),
        );

        Harness { pump, shared, control, secondary, closed, _staging: staging }
    }

    fn atomic_payload(ops: Vec<ReplicationOperation>, quorum: Lsn) -> Vec<u8> {
        AtomicOperation::new(Uuid::new_v4(), ops, quorum).encode().unwrap()
    }

    fn copy_payload(copy_type: CopyType, ops: Vec<ReplicationOperation>) -> Vec<u8> {
        CopyOperation::new(copy_type, ops).encode().unwrap()
    }

    fn stamped(mut op: ReplicationOperation, lsn: Lsn) -> ReplicationOperation {
        op.operation_lsn = lsn;
        op
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn read_store(shared: &SharedLocalStore) -> LocalStore {
        shared.read().unwrap().clone()
    }

    #[tokio::test]
    async fn pumps_copy_then_replication_and_closes() {
        let h = harness();
        h.pump.start();

        // One logical full-copy page, then copy EOS.
        let row = ReplicationOperation::copy_metadata("T", "k", b"v".to_vec(), 4);
        h.control
            .send_copy_operation(1, copy_payload(CopyType::FirstFullCopy, vec![row]))
            .unwrap();
        h.control.send_copy_end_of_stream(2).unwrap();

        wait_until(|| h.pump.state() == PumpState::Replication).await;
        {
            let store = read_store(&h.shared);
            let tx = store.create_transaction().unwrap();
            assert_eq!(tx.read_exact("T", "k").unwrap(), (b"v".to_vec(), 4));
        }

        // Then a replicated insert, then replication EOS.
        let ops = vec![stamped(ReplicationOperation::insert("T", "k2", b"w".to_vec()), 5)];
        h.control
            .send_replication_operation(5, atomic_payload(ops, 0))
            .unwrap();
        h.control.send_replication_end_of_stream(7).unwrap();

        wait_until(|| h.closed.load(Ordering::SeqCst)).await;
        assert_eq!(h.pump.state(), PumpState::Closed);

        let store = read_store(&h.shared);
        let tx = store.create_transaction().unwrap();
        assert_eq!(tx.read_exact("T", "k2").unwrap(), (b"w".to_vec(), 5));
        assert_eq!(h.pump.applied_batches(), 1);
        assert!(h.secondary.reported_faults().is_empty());
    }

    #[tokio::test]
    async fn insert_already_exists_falls_back_to_greater_lsn_update() {
        let h = harness();
        {
            let store = read_store(&h.shared);
            let mut tx = store.create_transaction().unwrap();
            tx.insert("T", "k", b"old", 2, None).unwrap();
            tx.commit().unwrap();
        }

        let store = read_store(&h.shared);
        let op = stamped(ReplicationOperation::insert("T", "k", b"new".to_vec()), 5);
        h.pump
            .apply_operations_with_retry(&store, &[op], false)
            .await
            .unwrap();

        let tx = store.create_transaction().unwrap();
        assert_eq!(tx.read_exact("T", "k").unwrap(), (b"new".to_vec(), 5));

        // A stale write behind the live LSN is ignored.
        let stale = stamped(ReplicationOperation::update("T", "k", None, b"stale".to_vec()), 3);
        h.pump
            .apply_operations_with_retry(&store, &[stale], false)
            .await
            .unwrap();
        let tx = store.create_transaction().unwrap();
        assert_eq!(tx.read_exact("T", "k").unwrap(), (b"new".to_vec(), 5));
    }

    #[tokio::test]
    async fn delete_applies_and_finalizes_indexed_tombstones() {
        let h = harness();
        {
            let store = read_store(&h.shared);
            let mut tx = store.create_transaction().unwrap();
            tx.insert("T", "a", b"1", 2, None).unwrap();
            tx.insert("T", "b", b"2", 2, None).unwrap();
            tx.commit().unwrap();
        }

        let store = read_store(&h.shared);
        let ops = vec![
            stamped(ReplicationOperation::delete("T", "a"), 6),
            stamped(ReplicationOperation::delete("T", "b"), 6),
        ];
        h.pump
            .apply_operations_with_retry(&store, &ops, false)
            .await
            .unwrap();

        let tx = store.create_transaction().unwrap();
        assert!(!tx.contains("T", "a"));
        assert!(tx.contains(TOMBSTONE_DATA_TYPE, "0x0000000000000006:0"));
        assert!(tx.contains(TOMBSTONE_DATA_TYPE, "0x0000000000000006:1"));
    }

    #[tokio::test]
    async fn delete_of_missing_row_with_pending_insert_conflicts() {
        let h = harness();
        let store = read_store(&h.shared);

        h.pump.add_pending_insert("T", "ghost", 4);
        let op = stamped(ReplicationOperation::delete("T", "ghost"), 6);

        let mut tx = store.create_transaction().unwrap();
        let result = h.pump.delete_if_data_item_exists(&mut tx, &op, 0);
        assert_eq!(result, Err(Error::WriteConflict));
        tx.rollback();

        // Once the insert commits the marker clears and the delete applies
        // as a plain no-op or live delete.
        let insert = stamped(ReplicationOperation::insert("T", "ghost", b"v".to_vec()), 4);
        h.pump
            .apply_operations_with_retry(&store, &[insert], false)
            .await
            .unwrap();
        h.pump
            .apply_operations_with_retry(&store, &[op], false)
            .await
            .unwrap();
        let tx = store.create_transaction().unwrap();
        assert!(!tx.contains("T", "ghost"));
    }

    #[tokio::test]
    async fn delete_of_missing_row_without_pending_insert_is_a_noop() {
        let h = harness();
        let store = read_store(&h.shared);

        let op = stamped(ReplicationOperation::delete("T", "never"), 6);
        h.pump
            .apply_operations_with_retry(&store, &[op], false)
            .await
            .unwrap();

        let tx = store.create_transaction().unwrap();
        assert!(!tx.contains(TOMBSTONE_DATA_TYPE, "0x0000000000000006:0"));
    }

    #[tokio::test]
    async fn copied_epoch_rows_land_in_metadata() {
        let h = harness();
        let store = read_store(&h.shared);

        let epoch_op = ReplicationOperation::copy_metadata(
            progress::PROGRESS_DATA_TYPE,
            progress::CURRENT_EPOCH_KEY,
            crate::codec::serialize(&CurrentEpochData { epoch: Epoch::new(3, 7) }).unwrap(),
            1,
        );
        h.pump
            .apply_operations_with_retry(&store, &[epoch_op], true)
            .await
            .unwrap();

        let tx = store.create_transaction().unwrap();
        assert_eq!(
            progress::read_current_epoch(&tx).unwrap().unwrap().epoch,
            Epoch::new(3, 7)
        );
        assert_eq!(*lock(&h.pump.inner.cached_epoch), Some(Epoch::new(3, 7)));
    }

    #[tokio::test]
    async fn cancel_drains_and_fires_closed_callback() {
        let h = harness();
        h.pump.start();
        wait_until(|| h.pump.state() == PumpState::Copy).await;

        h.pump.cancel();
        wait_until(|| h.closed.load(Ordering::SeqCst)).await;
        assert_eq!(h.pump.state(), PumpState::Closed);
    }
}
