//! Replication progress metadata rows.
//!
//! These rows live in the same logical table as user data but never
//! contribute to user LSN progress: they are stored at the sentinel
//! metadata sequence number.

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec;
use crate::error::{CResult, Error};
use crate::local::{Lsn, StoreTransaction};

pub const PROGRESS_DATA_TYPE: &str = "ProgressData";
pub const CURRENT_EPOCH_KEY: &str = "CurrentEpoch";
pub const EPOCH_HISTORY_KEY: &str = "EpochHistory";
pub const TOMBSTONE_LOW_WATERMARK_KEY: &str = "TombstoneLowWatermark";

pub const FABRIC_TIME_DATA_TYPE: &str = "FabricTimeDataType";
pub const FABRIC_TIME_DATA_KEY: &str = "FabricTimeDataKey";

pub const INCREMENTAL_BACKUP_DATA_TYPE: &str = "LocalStoreIncrementalBackupDataType";
pub const ALLOW_INCREMENTAL_BACKUP_KEY: &str = "AllowIncrementalBackup";

pub const PARTIAL_COPY_PROGRESS_DATA_TYPE: &str = "PartialCopyProgressDataType";
pub const PARTIAL_COPY_PROGRESS_DATA_KEY: &str = "PartialCopyProgressDataKey";

/// Metadata rows keep their stored LSN at this sentinel so they never count
/// as user progress.
pub const METADATA_SEQUENCE_NUMBER: Lsn = 1;

/// A configuration epoch. Ordering is lexicographic on
/// `(data_loss_number, configuration_number)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch {
    pub data_loss_number: i64,
    pub configuration_number: i64,
}

impl Epoch {
    pub fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Epoch { data_loss_number, configuration_number }
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:X}", self.data_loss_number, self.configuration_number)
    }
}

/// One step of a replica's history: the epoch and the last LSN committed
/// under it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressVectorEntry {
    pub epoch: Epoch,
    pub last_operation_lsn: Lsn,
}

/// The ordered progress vector persisted as the epoch history row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressVectorData {
    pub entries: Vec<ProgressVectorEntry>,
}

impl ProgressVectorData {
    pub fn new(entries: Vec<ProgressVectorEntry>) -> Self {
        ProgressVectorData { entries }
    }

    /// Appends an entry, keeping the history within `max_entries` by
    /// truncating from the front.
    pub fn append(&mut self, entry: ProgressVectorEntry, max_entries: usize) {
        self.entries.push(entry);
        if self.entries.len() > max_entries {
            let drop = self.entries.len() - max_entries;
            self.entries.drain(..drop);
        }
    }

    pub fn last(&self) -> Option<&ProgressVectorEntry> {
        self.entries.last()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentEpochData {
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TombstoneLowWatermarkData {
    pub operation_lsn: Lsn,
}

/// The persisted logical-time counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FabricTimeData {
    pub logical_time_stamp: i64,
}

/// Marker allowing incremental backups to chain onto a prior full backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalStoreIncrementalBackupData {
    pub allow_incremental_backup: bool,
    pub backup_chain_guid: Uuid,
    pub prev_backup_index: u32,
}

/// Start LSN of an in-progress snapshot-based partial copy, persisted so the
/// build can resume after a primary change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialCopyProgressData {
    pub last_start_lsn: Lsn,
}

fn read_metadata<T: serde::de::DeserializeOwned>(
    tx: &StoreTransaction,
    item_type: &str,
    key: &str,
) -> CResult<Option<T>> {
    match tx.read_exact(item_type, key) {
        Ok((bytes, _)) => Ok(Some(codec::deserialize(&bytes)?)),
        Err(Error::RecordNotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_metadata<T: serde::Serialize>(
    tx: &mut StoreTransaction,
    item_type: &str,
    key: &str,
    value: &T,
) -> CResult<()> {
    let bytes = codec::serialize(value)?;
    tx.upsert(item_type, key, &bytes, METADATA_SEQUENCE_NUMBER, None)
}

pub fn read_current_epoch(tx: &StoreTransaction) -> CResult<Option<CurrentEpochData>> {
    read_metadata(tx, PROGRESS_DATA_TYPE, CURRENT_EPOCH_KEY)
}

pub fn write_current_epoch(tx: &mut StoreTransaction, data: &CurrentEpochData) -> CResult<()> {
    write_metadata(tx, PROGRESS_DATA_TYPE, CURRENT_EPOCH_KEY, data)
}

pub fn read_epoch_history(tx: &StoreTransaction) -> CResult<Option<ProgressVectorData>> {
    read_metadata(tx, PROGRESS_DATA_TYPE, EPOCH_HISTORY_KEY)
}

pub fn write_epoch_history(tx: &mut StoreTransaction, data: &ProgressVectorData) -> CResult<()> {
    write_metadata(tx, PROGRESS_DATA_TYPE, EPOCH_HISTORY_KEY, data)
}

pub fn read_low_watermark(tx: &StoreTransaction) -> CResult<Option<TombstoneLowWatermarkData>> {
    read_metadata(tx, PROGRESS_DATA_TYPE, TOMBSTONE_LOW_WATERMARK_KEY)
}

pub fn write_low_watermark(
    tx: &mut StoreTransaction,
    data: &TombstoneLowWatermarkData,
) -> CResult<()> {
    write_metadata(tx, PROGRESS_DATA_TYPE, TOMBSTONE_LOW_WATERMARK_KEY, data)
}

pub fn read_fabric_time(tx: &StoreTransaction) -> CResult<Option<FabricTimeData>> {
    read_metadata(tx, FABRIC_TIME_DATA_TYPE, FABRIC_TIME_DATA_KEY)
}

pub fn write_fabric_time(tx: &mut StoreTransaction, data: &FabricTimeData) -> CResult<()> {
    write_metadata(tx, FABRIC_TIME_DATA_TYPE, FABRIC_TIME_DATA_KEY, data)
}

pub fn read_incremental_backup_marker(
    tx: &StoreTransaction,
) -> CResult<Option<LocalStoreIncrementalBackupData>> {
    read_metadata(tx, INCREMENTAL_BACKUP_DATA_TYPE, ALLOW_INCREMENTAL_BACKUP_KEY)
}

pub fn write_incremental_backup_marker(
    tx: &mut StoreTransaction,
    data: &LocalStoreIncrementalBackupData,
) -> CResult<()> {
    write_metadata(tx, INCREMENTAL_BACKUP_DATA_TYPE, ALLOW_INCREMENTAL_BACKUP_KEY, data)
}

pub fn read_partial_copy_progress(
    tx: &StoreTransaction,
) -> CResult<Option<PartialCopyProgressData>> {
    read_metadata(tx, PARTIAL_COPY_PROGRESS_DATA_TYPE, PARTIAL_COPY_PROGRESS_DATA_KEY)
}

pub fn write_partial_copy_progress(
    tx: &mut StoreTransaction,
    data: &PartialCopyProgressData,
) -> CResult<()> {
    write_metadata(tx, PARTIAL_COPY_PROGRESS_DATA_TYPE, PARTIAL_COPY_PROGRESS_DATA_KEY, data)
}

pub fn clear_partial_copy_progress(tx: &mut StoreTransaction) -> CResult<()> {
    match tx.delete(PARTIAL_COPY_PROGRESS_DATA_TYPE, PARTIAL_COPY_PROGRESS_DATA_KEY, None) {
        Ok(()) | Err(Error::RecordNotFound) => Ok(()),
        Err(err) => Err(err),
    }
}

/// True for row types that are excluded from the user-data copy stream and
/// handled through dedicated metadata paths.
pub fn is_metadata_type(item_type: &str) -> bool {
    item_type == PROGRESS_DATA_TYPE
        || item_type == INCREMENTAL_BACKUP_DATA_TYPE
        || item_type == PARTIAL_COPY_PROGRESS_DATA_TYPE
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::local::LocalStore;
    use crate::storage::memory::Memory;

    #[test]
    fn epoch_ordering_is_lexicographic() {
        assert!(Epoch::new(1, 5) < Epoch::new(2, 0));
        assert!(Epoch::new(2, 1) < Epoch::new(2, 2));
        assert_eq!(Epoch::new(3, 3), Epoch::new(3, 3));
    }

    #[test]
    fn history_truncates_from_the_front() {
        let mut pv = ProgressVectorData::default();
        for i in 0..10 {
            pv.append(
                ProgressVectorEntry { epoch: Epoch::new(1, i), last_operation_lsn: i * 10 },
                4,
            );
        }
        assert_eq!(pv.entries.len(), 4);
        assert_eq!(pv.entries[0].epoch.configuration_number, 6);
        assert_eq!(pv.last().unwrap().epoch.configuration_number, 9);
    }

    #[test]
    fn metadata_rows_round_trip_at_sentinel_lsn() -> crate::error::CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;

        let mut tx = store.create_transaction()?;
        write_current_epoch(&mut tx, &CurrentEpochData { epoch: Epoch::new(2, 0x10) })?;
        write_low_watermark(&mut tx, &TombstoneLowWatermarkData { operation_lsn: 42 })?;
        tx.commit()?;

        let tx = store.create_transaction()?;
        assert_eq!(
            read_current_epoch(&tx)?.unwrap().epoch,
            Epoch::new(2, 0x10)
        );
        assert_eq!(read_low_watermark(&tx)?.unwrap().operation_lsn, 42);
        assert_eq!(
            tx.get_operation_lsn(PROGRESS_DATA_TYPE, CURRENT_EPOCH_KEY)?,
            METADATA_SEQUENCE_NUMBER
        );

        // Metadata writes never advance user progress.
        assert_eq!(store.last_change_operation_lsn(), 0);
        Ok(())
    }
}
