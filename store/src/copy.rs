//! Primary-side build (copy) protocol.
//!
//! A joining or lagging secondary sends its copy context; the primary
//! decides between full and partial copy by walking its progress vector
//! backwards, then streams the selected LSN range as paged copy operations.
//! Pages never split rows that share an LSN; if a partial copy cannot find a
//! split point within budget it is promoted to a snapshot partial copy and
//! the secondary builds on a side store. Epoch updates, the epoch history
//! and (for logical full copies) the tombstone low watermark ride at the end
//! of pages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::codec;
use crate::config::StoreSettings;
use crate::error::{CResult, Error};
use crate::file_stream::{FileStreamFullCopyContext, FileStreamFullCopyManager};
use crate::local::{Lsn, StoreItem};
use crate::progress::{
    self, CurrentEpochData, ProgressVectorData, TombstoneLowWatermarkData,
    METADATA_SEQUENCE_NUMBER, PROGRESS_DATA_TYPE,
};
use crate::wire::{CopyContextData, CopyOperation, CopyType, ReplicationOperation};

/// Running totals for build activity on a primary.
#[derive(Default)]
pub struct CopyStatistics {
    partial_copy: AtomicU64,
    full_copy: AtomicU64,
    file_stream_copy: AtomicU64,
    file_stream_rebuild_copy: AtomicU64,
    false_progress: AtomicU64,
    stale_secondary: AtomicU64,
}

impl CopyStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_partial_copy(&self) -> u64 {
        self.partial_copy.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn on_full_copy(&self) -> u64 {
        self.full_copy.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn on_file_stream_full_copy(&self) -> u64 {
        self.file_stream_copy.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn on_file_stream_rebuild_copy(&self) -> u64 {
        self.file_stream_rebuild_copy.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn on_false_progress(&self) -> u64 {
        self.false_progress.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn on_stale_secondary(&self) -> u64 {
        self.stale_secondary.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn partial_copy_count(&self) -> u64 {
        self.partial_copy.load(Ordering::SeqCst)
    }

    pub fn full_copy_count(&self) -> u64 {
        self.full_copy.load(Ordering::SeqCst)
    }

    pub fn file_stream_full_copy_count(&self) -> u64 {
        self.file_stream_copy.load(Ordering::SeqCst)
    }

    pub fn false_progress_count(&self) -> u64 {
        self.false_progress.load(Ordering::SeqCst)
    }

    pub fn stale_secondary_count(&self) -> u64 {
        self.stale_secondary.load(Ordering::SeqCst)
    }
}

/// Blocks tombstone pruning while any build still reads from the store.
pub struct LowWatermarkReaderCount {
    count: AtomicU64,
    zero_notify: Notify,
}

impl LowWatermarkReaderCount {
    pub fn new() -> Arc<Self> {
        Arc::new(LowWatermarkReaderCount { count: AtomicU64::new(0), zero_notify: Notify::new() })
    }

    pub fn acquire(self: &Arc<Self>) -> LowWatermarkReaderGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        LowWatermarkReaderGuard { owner: self.clone() }
    }

    pub fn current(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until no build holds the reader lease.
    pub async fn wait_for_zero(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.zero_notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct LowWatermarkReaderGuard {
    owner: Arc<LowWatermarkReaderCount>,
}

impl Drop for LowWatermarkReaderGuard {
    fn drop(&mut self) {
        if self.owner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.owner.zero_notify.notify_waiters();
        }
    }
}

/// Outcome of the full-vs-partial negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyPlan {
    pub full: bool,
    pub start_lsn: Lsn,
    /// Index into the progress vector from which epoch updates stream, for
    /// partial copies.
    pub pv_start_index: Option<usize>,
}

impl CopyPlan {
    fn full_copy() -> Self {
        CopyPlan { full: true, start_lsn: 0, pv_start_index: None }
    }
}

/// Walks the progress vector backwards to decide between full and partial
/// copy, per the false-progress and stale-secondary rules.
pub fn decide_copy_type(
    progress_vector: &ProgressVectorData,
    context: &CopyContextData,
    low_watermark: Option<Lsn>,
    stats: &CopyStatistics,
) -> CResult<CopyPlan> {
    if !context.is_epoch_valid {
        log::info!("copy decision ({}): invalid secondary epoch, full copy", context.id);
        return Ok(CopyPlan::full_copy());
    }
    if context.last_operation_lsn <= 0 {
        log::info!("copy decision ({}): empty secondary, full copy", context.id);
        return Ok(CopyPlan::full_copy());
    }

    let primary_epoch = progress_vector
        .last()
        .ok_or_else(|| Error::Internal("empty primary progress vector".to_string()))?
        .epoch;
    if primary_epoch < context.epoch {
        return Err(Error::Internal(format!(
            "primary epoch less than secondary epoch: ({} < {})",
            primary_epoch, context.epoch
        )));
    }

    let mut matched = None;
    for (ix, entry) in progress_vector.entries.iter().enumerate().rev() {
        if context.last_operation_lsn > entry.last_operation_lsn
            || context.epoch.data_loss_number != entry.epoch.data_loss_number
            || context.epoch.configuration_number > entry.epoch.configuration_number
        {
            let count = stats.on_false_progress();
            log::info!(
                "copy decision ({}): false progress at [{}.{}] vs entry [{}.{}], full copy (count={})",
                context.id,
                context.epoch,
                context.last_operation_lsn,
                entry.epoch,
                entry.last_operation_lsn,
                count
            );
            return Ok(CopyPlan::full_copy());
        }
        if context.epoch.configuration_number == entry.epoch.configuration_number {
            matched = Some(ix);
            break;
        }
        // Keep seeking backwards through the progress vector.
    }

    let matched_index = match matched {
        Some(ix) => ix,
        None => {
            log::info!("copy decision ({}): epoch not found, full copy", context.id);
            return Ok(CopyPlan::full_copy());
        }
    };

    // A partial copy cannot reach behind pruned tombstones.
    if let Some(low_watermark) = low_watermark {
        if context.last_operation_lsn < low_watermark {
            let count = stats.on_stale_secondary();
            log::info!(
                "copy decision ({}): stale secondary at {} below low watermark {}, full copy (count={})",
                context.id,
                context.last_operation_lsn,
                low_watermark,
                count
            );
            return Ok(CopyPlan::full_copy());
        }
    }

    log::info!(
        "copy decision ({}): partial copy from {}",
        context.id,
        context.last_operation_lsn + 1
    );
    Ok(CopyPlan {
        full: false,
        start_lsn: context.last_operation_lsn + 1,
        pv_start_index: Some(matched_index),
    })
}

enum StreamKind {
    Logical {
        /// User rows in `(LSN, key)` order within the copied range.
        items: Vec<StoreItem>,
        pos: usize,
        next_page_type: CopyType,
        is_logical_full_copy: bool,
        /// Epoch updates stream from this progress vector index onwards.
        min_announce_index: usize,
        announced_pv_index: Option<usize>,
        low_watermark: Option<TombstoneLowWatermarkData>,
        low_watermark_sent: bool,
    },
    FileStream {
        context: Option<FileStreamFullCopyContext>,
        manager: Arc<FileStreamFullCopyManager>,
        rebuild: bool,
        first_chunk_sent: bool,
    },
}

/// Produces the ordered sequence of copy pages for one build.
pub struct CopyOperationEnumerator {
    kind: StreamKind,
    progress_vector: ProgressVectorData,
    upto_lsn: Lsn,
    target_page_size: usize,
    finished: bool,
    done: bool,
    _reader_lease: LowWatermarkReaderGuard,
}

impl CopyOperationEnumerator {
    /// Logical (paged) copy over a snapshot of user rows.
    ///
    /// `items` is every non-metadata row with `plan.start_lsn <= lsn <=
    /// upto_lsn`, sorted by `(lsn, type, key)`.
    pub fn new_logical(
        items: Vec<StoreItem>,
        plan: CopyPlan,
        progress_vector: ProgressVectorData,
        low_watermark: Option<TombstoneLowWatermarkData>,
        upto_lsn: Lsn,
        settings: &StoreSettings,
        stats: &CopyStatistics,
        reader_lease: LowWatermarkReaderGuard,
    ) -> Self {
        let next_page_type = if plan.full {
            stats.on_full_copy();
            CopyType::FirstFullCopy
        } else {
            stats.on_partial_copy();
            CopyType::FirstPartialCopy
        };

        CopyOperationEnumerator {
            kind: StreamKind::Logical {
                items,
                pos: 0,
                next_page_type,
                is_logical_full_copy: plan.full,
                min_announce_index: plan.pv_start_index.unwrap_or(0),
                announced_pv_index: None,
                low_watermark,
                low_watermark_sent: false,
            },
            progress_vector,
            upto_lsn,
            target_page_size: settings.target_copy_operation_size,
            finished: false,
            done: false,
            _reader_lease: reader_lease,
        }
    }

    /// Physical copy streaming a backup archive in chunks.
    pub fn new_file_stream(
        context: FileStreamFullCopyContext,
        manager: Arc<FileStreamFullCopyManager>,
        rebuild: bool,
        progress_vector: ProgressVectorData,
        upto_lsn: Lsn,
        settings: &StoreSettings,
        stats: &CopyStatistics,
        reader_lease: LowWatermarkReaderGuard,
    ) -> Self {
        if rebuild {
            stats.on_file_stream_rebuild_copy();
        } else {
            stats.on_file_stream_full_copy();
        }

        CopyOperationEnumerator {
            kind: StreamKind::FileStream {
                context: Some(context),
                manager,
                rebuild,
                first_chunk_sent: false,
            },
            progress_vector,
            upto_lsn,
            target_page_size: settings.target_copy_operation_size,
            finished: false,
            done: false,
            _reader_lease: reader_lease,
        }
    }

    pub fn upto_lsn(&self) -> Lsn {
        self.upto_lsn
    }

    /// The next copy page, or `None` once the stream has terminated (the
    /// caller then delivers end-of-stream).
    pub async fn get_next(&mut self) -> CResult<Option<CopyOperation>> {
        if self.done {
            return Ok(None);
        }
        if self.finished {
            self.done = true;
            return Ok(None);
        }

        match &mut self.kind {
            StreamKind::FileStream { context, manager, rebuild, first_chunk_sent } => {
                let ctx = context
                    .as_mut()
                    .ok_or_else(|| Error::InvalidState("file stream context released".to_string()))?;

                let chunk = ctx.read_next_chunk(!*first_chunk_sent, self.target_page_size)?;
                *first_chunk_sent = true;
                let is_last = chunk.is_last_chunk;
                let rebuild = *rebuild;
                let op = CopyOperation::new_file_stream(chunk, rebuild);

                if is_last {
                    self.finished = true;
                    if let Some(ctx) = context.take() {
                        manager.release_copy_context(ctx).await;
                    }
                }
                Ok(Some(op))
            }
            StreamKind::Logical { .. } => self.next_logical_page(),
        }
    }

    fn next_logical_page(&mut self) -> CResult<Option<CopyOperation>> {
        let upto_lsn = self.upto_lsn;
        let target_page_size = self.target_page_size;
        let pv = self.progress_vector.clone();

        let (items, pos, next_page_type, is_full, min_announce, announced, low_watermark, lw_sent) =
            match &mut self.kind {
                StreamKind::Logical {
                    items,
                    pos,
                    next_page_type,
                    is_logical_full_copy,
                    min_announce_index,
                    announced_pv_index,
                    low_watermark,
                    low_watermark_sent,
                } => (
                    items,
                    pos,
                    next_page_type,
                    *is_logical_full_copy,
                    *min_announce_index,
                    announced_pv_index,
                    low_watermark,
                    low_watermark_sent,
                ),
                StreamKind::FileStream { .. } => unreachable!("logical page on file stream"),
            };

        let mut operations: Vec<ReplicationOperation> = Vec::new();
        let mut approximate_size = 0usize;
        let mut series_lsn: Lsn = 0;
        let mut page_type = *next_page_type;
        let mut last_enumerated: Lsn = 0;
        let mut stream_finished = false;

        loop {
            let item = match items.get(*pos) {
                Some(item) => item,
                None => {
                    stream_finished = true;
                    break;
                }
            };
            if item.operation_lsn > upto_lsn {
                stream_finished = true;
                break;
            }

            if series_lsn == 0 {
                series_lsn = item.operation_lsn;
            }

            let op = ReplicationOperation::copy(item);
            approximate_size += op.approximate_size();

            // A page break is only taken at an LSN boundary: rows sharing an
            // LSN came from one transaction and must travel together.
            if item.operation_lsn != series_lsn {
                if approximate_size > target_page_size {
                    if page_type == CopyType::FirstPartialCopy {
                        log::info!(
                            "promoting partial copy to snapshot partial copy at lsn {} (series {})",
                            item.operation_lsn,
                            series_lsn
                        );
                        page_type = CopyType::FirstSnapshotPartialCopy;
                    }
                    break;
                }
                series_lsn = item.operation_lsn;
            }

            last_enumerated = item.operation_lsn;
            operations.push(op);
            *pos += 1;
        }

        // Epoch update when the page walked across a progress vector entry
        // boundary; the secondary persists it as its new current epoch so it
        // can resume from a different primary.
        let mut added_epoch_update = false;
        if last_enumerated > 0 {
            if let Some(effective) = Self::effective_pv_index(&pv, last_enumerated) {
                if effective >= min_announce
                    && announced.map_or(true, |announced| effective > announced)
                {
                    operations.push(Self::current_epoch_op(&pv, effective)?);
                    *announced = Some(effective);
                    added_epoch_update = true;
                }
            }
        }

        if stream_finished {
            // Epoch history is replaced wholesale on the secondary; it
            // cannot be built incrementally from the streamed updates.
            operations.push(ReplicationOperation::copy_metadata(
                PROGRESS_DATA_TYPE,
                progress::EPOCH_HISTORY_KEY,
                codec::serialize(&pv)?,
                METADATA_SEQUENCE_NUMBER,
            ));

            if !added_epoch_update && !pv.entries.is_empty() {
                operations.push(Self::current_epoch_op(&pv, pv.entries.len() - 1)?);
            }

            if is_full && !*lw_sent {
                if let Some(low_watermark) = low_watermark {
                    operations.push(ReplicationOperation::copy_metadata(
                        PROGRESS_DATA_TYPE,
                        progress::TOMBSTONE_LOW_WATERMARK_KEY,
                        codec::serialize(low_watermark)?,
                        METADATA_SEQUENCE_NUMBER,
                    ));
                    *lw_sent = true;
                }
            }

            self.finished = true;
        }

        *next_page_type = CopyType::PagedCopy;

        if operations.is_empty() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(CopyOperation::new(page_type, operations)))
    }

    /// Index of the progress vector entry governing `lsn`: the first entry
    /// whose last LSN is at or past it, or the last entry.
    fn effective_pv_index(pv: &ProgressVectorData, lsn: Lsn) -> Option<usize> {
        if pv.entries.is_empty() {
            return None;
        }
        match pv.entries.iter().position(|e| e.last_operation_lsn >= lsn) {
            Some(ix) => Some(ix),
            None => Some(pv.entries.len() - 1),
        }
    }

    fn current_epoch_op(pv: &ProgressVectorData, index: usize) -> CResult<ReplicationOperation> {
        let epoch = pv.entries[index].epoch;
        Ok(ReplicationOperation::copy_metadata(
            PROGRESS_DATA_TYPE,
            progress::CURRENT_EPOCH_KEY,
            codec::serialize(&CurrentEpochData { epoch })?,
            METADATA_SEQUENCE_NUMBER,
        ))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::progress::{Epoch, ProgressVectorEntry};

    fn pv(entries: &[(i64, i64, Lsn)]) -> ProgressVectorData {
        ProgressVectorData::new(
            entries
                .iter()
                .map(|(dl, cfg, lsn)| ProgressVectorEntry {
                    epoch: Epoch::new(*dl, *cfg),
                    last_operation_lsn: *lsn,
                })
                .collect(),
        )
    }

    fn context(epoch: Epoch, lsn: Lsn) -> CopyContextData {
        CopyContextData {
            id: "test".to_string(),
            is_epoch_valid: true,
            epoch,
            last_operation_lsn: lsn,
            replica_id: 7,
            is_file_stream_full_copy_supported: false,
        }
    }

    fn item(lsn: Lsn, key: &str, size: usize) -> StoreItem {
        StoreItem {
            item_type: "T".to_string(),
            key: key.to_string(),
            value: vec![0u8; size],
            operation_lsn: lsn,
            last_modified_on_primary_utc: None,
        }
    }

    fn settings(page: usize) -> StoreSettings {
        StoreSettings { target_copy_operation_size: page, ..StoreSettings::default() }
    }

    #[test]
    fn partial_copy_when_epoch_matches() {
        let stats = CopyStatistics::new();
        let pv = pv(&[(1, 1, 100), (1, 2, 200)]);
        let plan =
            decide_copy_type(&pv, &context(Epoch::new(1, 1), 50), None, &stats).unwrap();

        assert_eq!(
            plan,
            CopyPlan { full: false, start_lsn: 51, pv_start_index: Some(0) }
        );
        assert_eq!(stats.partial_copy_count(), 0);
        assert_eq!(stats.false_progress_count(), 0);
    }

    #[test]
    fn false_progress_forces_full_copy() {
        let stats = CopyStatistics::new();
        let pv = pv(&[(1, 1, 100)]);
        let plan =
            decide_copy_type(&pv, &context(Epoch::new(1, 1), 150), None, &stats).unwrap();

        assert_eq!(plan, CopyPlan::full_copy());
        assert_eq!(stats.false_progress_count(), 1);
    }

    #[test]
    fn stale_secondary_forces_full_copy() {
        let stats = CopyStatistics::new();
        let pv = pv(&[(1, 1, 100)]);
        let plan =
            decide_copy_type(&pv, &context(Epoch::new(1, 1), 40), Some(80), &stats).unwrap();

        assert_eq!(plan, CopyPlan::full_copy());
        assert_eq!(stats.stale_secondary_count(), 1);
    }

    #[test]
    fn invalid_or_empty_context_forces_full_copy() {
        let stats = CopyStatistics::new();
        let pv = pv(&[(1, 1, 100)]);

        let mut ctx = context(Epoch::new(1, 1), 50);
        ctx.is_epoch_valid = false;
        assert_eq!(decide_copy_type(&pv, &ctx, None, &stats).unwrap(), CopyPlan::full_copy());

        let ctx = context(Epoch::new(1, 1), 0);
        assert_eq!(decide_copy_type(&pv, &ctx, None, &stats).unwrap(), CopyPlan::full_copy());
    }

    #[test]
    fn data_loss_mismatch_is_false_progress() {
        let stats = CopyStatistics::new();
        let pv = pv(&[(2, 1, 100)]);
        let plan =
            decide_copy_type(&pv, &context(Epoch::new(1, 1), 50), None, &stats).unwrap();
        assert_eq!(plan, CopyPlan::full_copy());
        assert_eq!(stats.false_progress_count(), 1);
    }

    fn lease() -> (Arc<LowWatermarkReaderCount>, LowWatermarkReaderGuard) {
        let counter = LowWatermarkReaderCount::new();
        let guard = counter.acquire();
        (counter, guard)
    }

    #[tokio::test]
    async fn rows_sharing_an_lsn_stay_in_one_page() {
        let stats = CopyStatistics::new();
        let (_, guard) = lease();

        // Three rows at LSN 7 of 1KB each against a 1KB page target, then a
        // row at LSN 8.
        let items = vec![
            item(7, "a", 1024),
            item(7, "b", 1024),
            item(7, "c", 1024),
            item(8, "d", 16),
        ];
        let mut enumerator = CopyOperationEnumerator::new_logical(
            items,
            CopyPlan::full_copy(),
            pv(&[(1, 1, 8)]),
            None,
            8,
            &settings(1024),
            &stats,
            guard,
        );

        let page1 = enumerator.get_next().await.unwrap().unwrap();
        let user_ops: Vec<&ReplicationOperation> = page1
            .operations
            .iter()
            .filter(|op| op.item_type == "T")
            .collect();
        assert_eq!(user_ops.len(), 3);
        assert!(user_ops.iter().all(|op| op.operation_lsn == 7));
        assert_eq!(page1.copy_type(), CopyType::FirstFullCopy);

        let page2 = enumerator.get_next().await.unwrap().unwrap();
        assert_eq!(page2.copy_type(), CopyType::PagedCopy);
        assert!(page2.operations.iter().any(|op| op.operation_lsn == 8));

        assert!(enumerator.get_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_first_partial_page_promotes_to_snapshot_partial() {
        let stats = CopyStatistics::new();
        let (_, guard) = lease();

        let items = vec![item(5, "a", 2048), item(6, "b", 2048), item(7, "c", 16)];
        let mut enumerator = CopyOperationEnumerator::new_logical(
            items,
            CopyPlan { full: false, start_lsn: 5, pv_start_index: Some(0) },
            pv(&[(1, 1, 7)]),
            None,
            7,
            &settings(1024),
            &stats,
            guard,
        );

        let page1 = enumerator.get_next().await.unwrap().unwrap();
        assert_eq!(page1.copy_type(), CopyType::FirstSnapshotPartialCopy);
        assert_eq!(stats.partial_copy_count(), 1);
    }

    #[tokio::test]
    async fn final_page_carries_history_epoch_and_low_watermark() {
        let stats = CopyStatistics::new();
        let (_, guard) = lease();

        let history = pv(&[(1, 1, 100), (1, 2, 200)]);
        let items = vec![item(42, "a", 8)];
        let mut enumerator = CopyOperationEnumerator::new_logical(
            items,
            CopyPlan::full_copy(),
            history.clone(),
            Some(TombstoneLowWatermarkData { operation_lsn: 30 }),
            200,
            &settings(1 << 20),
            &stats,
            guard,
        );

        let page = enumerator.get_next().await.unwrap().unwrap();
        let keys: Vec<&str> = page
            .operations
            .iter()
            .filter(|op| op.item_type == PROGRESS_DATA_TYPE)
            .map(|op| op.key.as_str())
            .collect();
        assert_eq!(
            keys,
            vec![
                progress::CURRENT_EPOCH_KEY,
                progress::EPOCH_HISTORY_KEY,
                progress::TOMBSTONE_LOW_WATERMARK_KEY,
            ]
        );

        let history_op = page
            .operations
            .iter()
            .find(|op| op.key == progress::EPOCH_HISTORY_KEY)
            .unwrap();
        let decoded: ProgressVectorData = codec::deserialize(&history_op.bytes).unwrap();
        assert_eq!(decoded, history);

        assert!(enumerator.get_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_copy_omits_low_watermark() {
        let stats = CopyStatistics::new();
        let (_, guard) = lease();

        let items = vec![item(51, "a", 8)];
        let mut enumerator = CopyOperationEnumerator::new_logical(
            items,
            CopyPlan { full: false, start_lsn: 51, pv_start_index: Some(0) },
            pv(&[(1, 1, 100)]),
            Some(TombstoneLowWatermarkData { operation_lsn: 30 }),
            100,
            &settings(1 << 20),
            &stats,
            guard,
        );

        let page = enumerator.get_next().await.unwrap().unwrap();
        assert!(!page
            .operations
            .iter()
            .any(|op| op.key == progress::TOMBSTONE_LOW_WATERMARK_KEY));
    }

    #[tokio::test]
    async fn reader_lease_releases_on_drop() {
        let counter = LowWatermarkReaderCount::new();
        let guard = counter.acquire();
        assert_eq!(counter.current(), 1);
        drop(guard);
        assert_eq!(counter.current(), 0);
        counter.wait_for_zero().await;
    }
}
