//! The replicated store replica.
//!
//! One `ReplicatedStore` owns the local store, the role state machine and
//! the pipelines hanging off it: the transaction replicator while primary,
//! the secondary pump while secondary, the copy machinery while building
//! peers, plus tombstone pruning and the logical-time counter. Role changes
//! are idempotent and park on outstanding work (open transactions, the
//! pump) before completing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::StoreSettings;
use crate::copy::{
    decide_copy_type, CopyOperationEnumerator, CopyStatistics, LowWatermarkReaderCount,
};
use crate::error::{CResult, Error};
use crate::file_stream::FileStreamFullCopyManager;
use crate::health::HealthTracker;
use crate::local::{LocalStore, Lsn, SharedLocalStore};
use crate::notify::NotificationManager;
use crate::progress::{
    self, CurrentEpochData, Epoch, FabricTimeData, LocalStoreIncrementalBackupData,
    ProgressVectorData, ProgressVectorEntry, TombstoneLowWatermarkData,
};
use crate::pump::SecondaryPump;
use crate::replication::TransactionReplicator;
use crate::replicator::{FaultType, StateReplicator};
use crate::state::{ReplicatedStoreEvent, ReplicatedStoreState, StateMachine};
use crate::storage::engine::EngineFactory;
use crate::throttle::Throttle;
use crate::tombstone::{self, TOMBSTONE_DATA_TYPE};
use crate::txn::{FinishCallback, SimpleTransaction, SimpleTransactionGroup, Transaction};
use crate::wire::CopyContextData;

/// Store directories deeper than this trip the engine's path limits.
const MAX_STORE_DIRECTORY_LENGTH: usize = 246;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaRole {
    Primary,
    IdleSecondary,
    ActiveSecondary,
    None,
}

pub type DataLossHandler = Arc<dyn Fn() -> CResult<bool> + Send + Sync>;

/// Cluster-local monotonic logical clock, persisted periodically while
/// primary so it survives failover.
struct FabricTime {
    logical_ticks: AtomicI64,
    restarted: Mutex<Instant>,
}

impl FabricTime {
    fn new(persisted: i64) -> Self {
        FabricTime {
            logical_ticks: AtomicI64::new(persisted),
            restarted: Mutex::new(Instant::now()),
        }
    }

    fn refresh(&self) -> i64 {
        let mut restarted = lock(&self.restarted);
        let elapsed = restarted.elapsed().as_millis() as i64;
        *restarted = Instant::now();
        self.logical_ticks.fetch_add(elapsed, Ordering::SeqCst) + elapsed
    }

    fn current(&self) -> i64 {
        let elapsed = lock(&self.restarted).elapsed().as_millis() as i64;
        self.logical_ticks.load(Ordering::SeqCst) + elapsed
    }
}

struct ReplicaInner {
    settings: StoreSettings,
    data_dir: PathBuf,
    replica_id: u64,
    state: StateMachine,
    shared_store: SharedLocalStore,
    engine_factory: EngineFactory,
    replicator: Arc<dyn StateReplicator>,
    txn_replicator: Mutex<Option<TransactionReplicator>>,
    throttle: Arc<Throttle>,
    health: Arc<HealthTracker>,
    stats: Arc<CopyStatistics>,
    notifications: Arc<NotificationManager>,
    cached_epoch: Arc<Mutex<Option<Epoch>>>,
    lw_readers: Arc<LowWatermarkReaderCount>,
    tombstone_estimate: AtomicU64,
    prune_running: AtomicBool,
    file_stream: Arc<FileStreamFullCopyManager>,
    pump: Mutex<Option<SecondaryPump>>,
    group: Mutex<Option<SimpleTransactionGroup>>,
    fabric_time: FabricTime,
    data_loss_handler: Mutex<Option<DataLossHandler>>,
}

#[derive(Clone)]
pub struct ReplicatedStore {
    inner: Arc<ReplicaInner>,
}

impl ReplicatedStore {
    /// Opens the replica: builds the local store from the data directory,
    /// recovers progress metadata, and moves the state machine to `Opened`.
    pub async fn open(
        settings: StoreSettings,
        data_dir: PathBuf,
        replica_id: u64,
        engine_factory: EngineFactory,
        replicator: Arc<dyn StateReplicator>,
        notifications: Arc<NotificationManager>,
    ) -> CResult<Self> {
        let health = Arc::new(HealthTracker::new(
            settings.slow_commit_threshold(),
            settings.slow_commit_count_threshold,
        ));

        let store_dir = data_dir.join(crate::storage::read_current_store_dir(&data_dir));
        if store_dir.to_string_lossy().len() > MAX_STORE_DIRECTORY_LENGTH {
            let path = store_dir.to_string_lossy().into_owned();
            health.report_path_too_long(&path);
            return Err(Error::PathTooLong(path));
        }
        std::fs::create_dir_all(&store_dir)?;
        let engine = engine_factory(&store_dir)?;
        let store = LocalStore::open(engine)?;

        let (cached_epoch, persisted_time) = {
            let tx = store.create_transaction()?;
            let epoch = progress::read_current_epoch(&tx)?.map(|data| data.epoch);
            let time = progress::read_fabric_time(&tx)?.unwrap_or_default();
            tx.rollback();
            (epoch, time.logical_time_stamp)
        };

        let shared_store: SharedLocalStore = Arc::new(std::sync::RwLock::new(store));
        let throttle = Throttle::new(replicator.clone(), &settings);
        let file_stream = FileStreamFullCopyManager::new(
            shared_store.clone(),
            data_dir.join("filestream"),
            settings.max_file_stream_full_copy_waiters,
        );

        let replica = ReplicatedStore {
            inner: Arc::new(ReplicaInner {
                health,
                settings,
                data_dir,
                replica_id,
                state: StateMachine::new(),
                shared_store,
                engine_factory,
                replicator,
                txn_replicator: Mutex::new(None),
                throttle,
                stats: Arc::new(CopyStatistics::new()),
                notifications,
                cached_epoch: Arc::new(Mutex::new(cached_epoch)),
                lw_readers: LowWatermarkReaderCount::new(),
                tombstone_estimate: AtomicU64::new(0),
                prune_running: AtomicBool::new(false),
                file_stream,
                pump: Mutex::new(None),
                group: Mutex::new(None),
                fabric_time: FabricTime::new(persisted_time),
                data_loss_handler: Mutex::new(None),
            }),
        };

        replica
            .inner
            .state
            .process_event_simple(ReplicatedStoreEvent::Open)?;
        replica.inner.throttle.transition_to_initialized();

        log::info!(
            "replica {} opened at lsn {} epoch {:?}",
            replica_id,
            replica.current_store().last_change_operation_lsn(),
            cached_epoch
        );
        Ok(replica)
    }

    pub fn state(&self) -> ReplicatedStoreState {
        self.inner.state.current_state()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    pub fn statistics(&self) -> Arc<CopyStatistics> {
        self.inner.stats.clone()
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.inner.health.clone()
    }

    pub fn last_committed_lsn(&self) -> Lsn {
        self.current_store().last_change_operation_lsn()
    }

    /// Cluster-local monotonic time.
    pub fn current_store_time(&self) -> i64 {
        self.inner.fabric_time.current()
    }

    pub fn set_data_loss_handler(&self, handler: DataLossHandler) {
        *lock(&self.inner.data_loss_handler) = Some(handler);
    }

    /// Host callback after a data-loss event; returns whether application
    /// state changed.
    pub async fn on_data_loss(&self) -> CResult<bool> {
        let handler = lock(&self.inner.data_loss_handler).clone();
        match handler {
            Some(handler) => handler(),
            None => Ok(false),
        }
    }

    /// Role changes are idempotent and safe to re-invoke.
    pub async fn change_role(&self, role: ReplicaRole) -> CResult<()> {
        match role {
            ReplicaRole::Primary => {
                let state = self
                    .inner
                    .state
                    .process_event_simple(ReplicatedStoreEvent::ChangePrimary)?;

                if state == ReplicatedStoreState::SecondaryChangePending {
                    if let Some(pump) = lock(&self.inner.pump).clone() {
                        pump.cancel();
                    }
                    self.wait_for_state(ReplicatedStoreState::PrimaryPassive).await?;
                }
                self.init_primary();
                Ok(())
            }
            ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary => {
                let state = self
                    .inner
                    .state
                    .process_event_simple(ReplicatedStoreEvent::ChangeSecondary)?;

                if state == ReplicatedStoreState::PrimaryChangePending {
                    self.wait_for_state(ReplicatedStoreState::SecondaryActive).await?;
                }
                self.demote_primary();
                self.start_pump_if_needed();
                Ok(())
            }
            ReplicaRole::None => {
                self.demote_primary();
                if let Some(pump) = lock(&self.inner.pump).clone() {
                    pump.cancel();
                }
                Ok(())
            }
        }
    }

    /// Cooperative drain and shutdown. Idempotent.
    pub async fn close(&self) -> CResult<()> {
        self.inner
            .state
            .process_event_simple(ReplicatedStoreEvent::Close)?;

        if let Some(txr) = lock(&self.inner.txn_replicator).clone() {
            txr.close();
        }
        if let Some(pump) = lock(&self.inner.pump).clone() {
            pump.cancel();
        }

        self.wait_for_state(ReplicatedStoreState::Closed).await?;
        self.finalize_close();
        Ok(())
    }

    /// Immediate teardown without draining.
    pub fn abort(&self) {
        self.inner.state.abort();
        if let Some(txr) = lock(&self.inner.txn_replicator).clone() {
            txr.close();
        }
        if let Some(pump) = lock(&self.inner.pump).clone() {
            pump.cancel();
        }
        self.finalize_close();
    }

    /// Starts a replicated read-write transaction. Admission is gated on
    /// the replica being primary.
    pub fn create_transaction(&self) -> CResult<Transaction> {
        self.inner
            .state
            .process_event_simple(ReplicatedStoreEvent::StartTransaction)?;

        match self.create_transaction_inner() {
            Ok(tx) => Ok(tx),
            Err(err) => {
                Self::handle_finish_transaction(&self.inner);
                Err(err)
            }
        }
    }

    fn create_transaction_inner(&self) -> CResult<Transaction> {
        let txr = lock(&self.inner.txn_replicator)
            .clone()
            .ok_or(Error::NotPrimary)?;
        let store_tx = self.current_store().create_transaction()?;
        Ok(Transaction::new(
            txr,
            store_tx,
            self.inner.settings.commit_timeout(),
            Some(self.finish_callback()),
        ))
    }

    /// Joins (or starts) the current simple transaction group.
    pub fn create_simple_transaction(&self) -> CResult<SimpleTransaction> {
        self.inner
            .state
            .process_event_simple(ReplicatedStoreEvent::StartTransaction)?;

        match self.create_simple_transaction_inner() {
            Ok(tx) => Ok(tx),
            Err(err) => {
                Self::handle_finish_transaction(&self.inner);
                Err(err)
            }
        }
    }

    fn create_simple_transaction_inner(&self) -> CResult<SimpleTransaction> {
        let txr = lock(&self.inner.txn_replicator)
            .clone()
            .ok_or(Error::NotPrimary)?;

        let mut slot = lock(&self.inner.group);
        if slot.as_ref().map_or(true, |group| group.is_sealed()) {
            let store_tx = self.current_store().create_transaction()?;
            *slot = Some(SimpleTransactionGroup::new(
                txr,
                store_tx,
                self.inner.settings.simple_transaction_group_size_limit,
            ));
        }
        slot.as_ref()
            .expect("group just installed")
            .create_simple_transaction(Some(self.finish_callback()))
    }

    /// Installs a new epoch: appends the outgoing epoch to the history and
    /// overwrites the current-epoch row in one local transaction. The local
    /// commit must succeed before the new epoch is considered installed.
    pub async fn update_epoch(
        &self,
        new_epoch: Epoch,
        previous_epoch_last_lsn: Lsn,
    ) -> CResult<()> {
        let cached = *lock(&self.inner.cached_epoch);
        if let Some(current) = cached {
            if new_epoch < current {
                return Err(Error::InvalidOperation(format!(
                    "epoch {} below current {}",
                    new_epoch, current
                )));
            }
            if new_epoch == current {
                return Ok(());
            }
        }

        let store = self.current_store();
        let result = (|| -> CResult<()> {
            let mut tx = store.create_transaction()?;
            let mut history = progress::read_epoch_history(&tx)?.unwrap_or_default();
            if let Some(current) = cached {
                history.append(
                    ProgressVectorEntry {
                        epoch: current,
                        last_operation_lsn: previous_epoch_last_lsn,
                    },
                    self.inner.settings.max_epoch_history_count,
                );
            }
            progress::write_epoch_history(&mut tx, &history)?;
            progress::write_current_epoch(&mut tx, &CurrentEpochData { epoch: new_epoch })?;
            tx.commit()
        })();

        match result {
            Ok(()) => {
                *lock(&self.inner.cached_epoch) = Some(new_epoch);
                log::info!("installed epoch {} (previous last lsn {})", new_epoch, previous_epoch_last_lsn);
                Ok(())
            }
            Err(err) => {
                // Progress metadata must never diverge from the replicator's
                // view of the epoch.
                log::error!("failed to persist epoch {}: {}", new_epoch, err);
                self.inner.replicator.report_fault(FaultType::Transient);
                Err(err)
            }
        }
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        *lock(&self.inner.cached_epoch)
    }

    /// The secondary's self-description for build negotiation.
    pub fn get_copy_context(&self) -> CResult<CopyContextData> {
        let store = self.current_store();
        let epoch = {
            let tx = store.create_transaction()?;
            let epoch = progress::read_current_epoch(&tx)?.map(|data| data.epoch);
            tx.rollback();
            epoch
        };

        Ok(CopyContextData {
            id: format!("replica-{}", self.inner.replica_id),
            is_epoch_valid: epoch.is_some(),
            epoch: epoch.unwrap_or_default(),
            last_operation_lsn: store.last_change_operation_lsn(),
            replica_id: self.inner.replica_id,
            is_file_stream_full_copy_supported: self
                .inner
                .settings
                .enable_file_stream_full_copy,
        })
    }

    /// Primary-side entry point for building a secondary from its copy
    /// context. The returned enumerator produces the paged copy stream.
    pub async fn create_copy_operation_enumerator(
        &self,
        context: CopyContextData,
    ) -> CResult<CopyOperationEnumerator> {
        let store = self.current_store();
        let upto_lsn = store.last_change_operation_lsn();

        // The committed LSN must have reached the captured build target
        // before enumeration starts.
        let mut retries = 0;
        while store.last_change_operation_lsn() < upto_lsn {
            if retries >= self.inner.settings.max_wait_for_copy_lsn_retry {
                return Err(Error::Internal(format!(
                    "committed lsn {} never reached copy target {}",
                    store.last_change_operation_lsn(),
                    upto_lsn
                )));
            }
            retries += 1;
            tokio::time::sleep(Duration::from_millis(
                self.inner.settings.copy_lsn_wait_delay_ms,
            ))
            .await;
        }

        let reader_lease = self.inner.lw_readers.acquire();
        let tx = store.create_transaction()?;

        let history = progress::read_epoch_history(&tx)?.unwrap_or_default();
        let current_epoch = progress::read_current_epoch(&tx)?
            .map(|data| data.epoch)
            .or(*lock(&self.inner.cached_epoch))
            .ok_or_else(|| Error::Internal("primary has no installed epoch".to_string()))?;

        let mut pv = history.entries.clone();
        match pv.last_mut() {
            Some(last) if last.epoch == current_epoch => {
                last.last_operation_lsn = upto_lsn;
            }
            _ => pv.push(ProgressVectorEntry {
                epoch: current_epoch,
                last_operation_lsn: upto_lsn,
            }),
        }
        let pv = ProgressVectorData::new(pv);

        let low_watermark = progress::read_low_watermark(&tx)?;
        let plan = decide_copy_type(
            &pv,
            &context,
            low_watermark.map(|lw| lw.operation_lsn),
            &self.inner.stats,
        )?;

        if plan.full
            && context.is_file_stream_full_copy_supported
            && self.inner.settings.enable_file_stream_full_copy
        {
            drop(tx);
            match self.inner.file_stream.get_copy_context(upto_lsn).await {
                Ok(fs_context) => {
                    return Ok(CopyOperationEnumerator::new_file_stream(
                        fs_context,
                        self.inner.file_stream.clone(),
                        false,
                        pv,
                        upto_lsn,
                        &self.inner.settings,
                        &self.inner.stats,
                        reader_lease,
                    ));
                }
                Err(Error::MaxFileStreamFullCopyWaiters) | Err(Error::BackupInProgress) => {
                    log::info!("file stream copy unavailable, falling back to logical full copy");
                }
                Err(err) => return Err(err),
            }

            let tx = store.create_transaction()?;
            let items = Self::collect_copy_items(&tx, plan.start_lsn, upto_lsn)?;
            tx.rollback();
            return Ok(CopyOperationEnumerator::new_logical(
                items,
                plan,
                pv,
                low_watermark,
                upto_lsn,
                &self.inner.settings,
                &self.inner.stats,
                reader_lease,
            ));
        }

        let items = Self::collect_copy_items(&tx, plan.start_lsn, upto_lsn)?;
        tx.rollback();

        Ok(CopyOperationEnumerator::new_logical(
            items,
            plan,
            pv,
            low_watermark,
            upto_lsn,
            &self.inner.settings,
            &self.inner.stats,
            reader_lease,
        ))
    }

    fn collect_copy_items(
        tx: &crate::local::StoreTransaction,
        start_lsn: Lsn,
        upto_lsn: Lsn,
    ) -> CResult<Vec<crate::local::StoreItem>> {
        let mut items = Vec::new();
        for item in tx.enumerate_by_operation_lsn(start_lsn)? {
            if item.operation_lsn > upto_lsn {
                break;
            }
            if progress::is_metadata_type(&item.item_type) {
                continue;
            }
            items.push(item);
        }
        Ok(items)
    }

    /// Takes a physical backup and records the incremental-backup marker so
    /// later incrementals can chain onto it.
    pub async fn backup(&self, dir: &std::path::Path) -> CResult<()> {
        let store = self.current_store();
        store.backup(dir)?;

        let mut tx = store.create_transaction()?;
        progress::write_incremental_backup_marker(
            &mut tx,
            &LocalStoreIncrementalBackupData {
                allow_incremental_backup: true,
                backup_chain_guid: uuid::Uuid::new_v4(),
                prev_backup_index: 0,
            },
        )?;
        tx.commit()
    }

    pub fn current_store(&self) -> LocalStore {
        match self.inner.shared_store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn init_primary(&self) {
        let mut slot = lock(&self.inner.txn_replicator);
        if slot.is_some() {
            return;
        }

        let txr = TransactionReplicator::new(
            self.current_store(),
            self.inner.replicator.clone(),
            self.inner.settings.clone(),
            self.inner.health.clone(),
        );
        txr.set_throttle(self.inner.throttle.clone());
        let inner = self.inner.clone();
        txr.set_tombstone_callback(Arc::new(move |count| {
            Self::schedule_tombstone_cleanup(&inner, count);
        }));
        *slot = Some(txr);
        drop(slot);

        self.inner.throttle.transition_to_started();
        self.start_fabric_time_refresh();
        log::info!("replica {} primary pipelines started", self.inner.replica_id);
    }

    fn demote_primary(&self) {
        if let Some(txr) = lock(&self.inner.txn_replicator).take() {
            txr.close();
        }
        lock(&self.inner.group).take();
    }

    fn start_pump_if_needed(&self) {
        let mut slot = lock(&self.inner.pump);
        if slot.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let pump = SecondaryPump::new(
            self.inner.settings.clone(),
            self.inner.replicator.clone(),
            self.inner.shared_store.clone(),
            self.inner.engine_factory.clone(),
            self.inner.data_dir.clone(),
            self.inner.notifications.clone(),
            self.inner.cached_epoch.clone(),
            Box::new(move || {
                Self::handle_pump_closed(&inner);
            }),
        );
        pump.start();
        *slot = Some(pump);
    }

    fn handle_pump_closed(inner: &Arc<ReplicaInner>) {
        let mut reached = ReplicatedStoreState::Closed;
        inner.state.process_event(
            ReplicatedStoreEvent::SecondaryPumpClosed,
            |result, state| {
                if let Err(err) = result {
                    log::warn!("pump closed event rejected: {}", err);
                }
                reached = state;
            },
        );

        lock(&inner.pump).take();
        inner.notifications.clear_pending();

        if reached == ReplicatedStoreState::Closed {
            Self::finalize_close_inner(inner);
        }
    }

    fn finish_callback(&self) -> FinishCallback {
        let inner = self.inner.clone();
        Arc::new(move || {
            Self::handle_finish_transaction(&inner);
        })
    }

    fn handle_finish_transaction(inner: &Arc<ReplicaInner>) {
        let mut reached = ReplicatedStoreState::Created;
        inner
            .state
            .process_event(ReplicatedStoreEvent::FinishTransaction, |result, state| {
                if let Err(err) = result {
                    log::warn!("finish transaction event rejected: {}", err);
                }
                reached = state;
            });

        match reached {
            ReplicatedStoreState::Closed => Self::finalize_close_inner(inner),
            ReplicatedStoreState::SecondaryActive => {
                // Demotion parked on the last transaction; primary pipelines
                // come down and the pump takes over.
                let replica = ReplicatedStore { inner: inner.clone() };
                replica.demote_primary();
                replica.start_pump_if_needed();
            }
            _ => {}
        }
    }

    fn finalize_close(&self) {
        Self::finalize_close_inner(&self.inner);
    }

    fn finalize_close_inner(inner: &Arc<ReplicaInner>) {
        inner.throttle.transition_to_stopped();
        inner.notifications.drain();
        let store = match inner.shared_store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        store.close();
        log::info!("replica {} closed", inner.replica_id);
    }

    async fn wait_for_state(&self, target: ReplicatedStoreState) -> CResult<()> {
        for _ in 0..6000 {
            let state = self.inner.state.current_state();
            if state == target {
                return Ok(());
            }
            if state == ReplicatedStoreState::Closed
                && target != ReplicatedStoreState::Closed
            {
                return Err(Error::ObjectClosed);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Err(Error::Timeout)
    }

    fn schedule_tombstone_cleanup(inner: &Arc<ReplicaInner>, added: u64) {
        let estimate = inner.tombstone_estimate.fetch_add(added, Ordering::SeqCst) + added;
        if estimate < inner.settings.tombstone_cleanup_limit {
            return;
        }
        if inner.prune_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            // Active builds hold the low-watermark reader lease; pruning
            // must not run under them.
            inner.lw_readers.wait_for_zero().await;

            match Self::prune_tombstones(&inner) {
                Ok(pruned) => {
                    if pruned > 0 {
                        log::info!("pruned {} tombstones", pruned);
                    }
                    inner.tombstone_estimate.store(0, Ordering::SeqCst);
                }
                Err(err) => log::warn!("tombstone prune failed: {}", err),
            }
            inner.prune_running.store(false, Ordering::SeqCst);
        });
    }

    fn prune_tombstones(inner: &Arc<ReplicaInner>) -> CResult<u64> {
        // Everything at or below the quorum-acked LSN is safe to drop: any
        // replica still behind it takes the stale-secondary full-copy path.
        let low_watermark = inner.replicator.last_quorum_acked_lsn();
        if low_watermark <= 0 {
            return Ok(0);
        }

        let store = match inner.shared_store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let batch = inner.settings.tombstone_prune_batch;
        let mut total = 0u64;
        loop {
            let mut tx = store.create_transaction()?;
            let keys = tombstone::enumerate_prunable(&tx, low_watermark, batch)?;
            if keys.is_empty() {
                tx.rollback();
                break;
            }
            for key in &keys {
                tx.delete(TOMBSTONE_DATA_TYPE, key, None)?;
            }
            progress::write_low_watermark(
                &mut tx,
                &TombstoneLowWatermarkData { operation_lsn: low_watermark },
            )?;
            let count = keys.len();
            tx.commit()?;
            total += count as u64;
            if count < batch {
                break;
            }
        }
        Ok(total)
    }

    fn start_fabric_time_refresh(&self) {
        let interval = self.inner.settings.fabric_time_refresh_interval_ms;
        if interval == 0 {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(interval);
            loop {
                tokio::time::sleep(period).await;
                match inner.state.current_state() {
                    ReplicatedStoreState::PrimaryPassive
                    | ReplicatedStoreState::PrimaryActive
                    | ReplicatedStoreState::PrimaryChangePending
                    | ReplicatedStoreState::PrimaryClosePending => {}
                    _ => break,
                }

                let ticks = inner.fabric_time.refresh();
                let store = match inner.shared_store.read() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                let result = store.create_transaction().and_then(|mut tx| {
                    progress::write_fabric_time(
                        &mut tx,
                        &FabricTimeData { logical_time_stamp: ticks },
                    )?;
                    tx.commit()
                });
                if let Err(err) = result {
                    log::warn!("logical time refresh failed: {}", err);
                    break;
                }
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
