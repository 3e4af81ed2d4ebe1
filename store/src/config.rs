use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Tunables for a replicated store replica.
///
/// Every field has a default so that settings files only need to override
/// what they care about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Target serialized size of one copy page. Rows sharing an LSN are never
    /// split across pages, so a page may exceed this.
    pub target_copy_operation_size: usize,

    /// Maximum number of entries retained in the epoch history row.
    pub max_epoch_history_count: usize,

    /// Pending tombstone estimate above which a prune is scheduled.
    pub tombstone_cleanup_limit: u64,

    /// Maximum tombstones deleted per prune transaction.
    pub tombstone_prune_batch: usize,

    /// Apply retry attempts on the secondary for retryable errors.
    pub secondary_apply_retry_count: u32,

    /// Base delay between secondary apply retries, in milliseconds.
    pub secondary_apply_retry_delay_ms: u64,

    /// How many short delays the primary waits for its committed LSN to reach
    /// the copy target before treating it as a coding error.
    pub max_wait_for_copy_lsn_retry: u32,

    /// Length of one copy-LSN wait delay, in milliseconds.
    pub copy_lsn_wait_delay_ms: u64,

    /// Local commit duration above which the slow-commit path traces and the
    /// health tracker is notified, in milliseconds.
    pub slow_commit_trace_threshold_ms: u64,

    /// Size of the slow-commit circular buffer; a health warning is emitted
    /// when this many slow commits land within the threshold window.
    pub slow_commit_count_threshold: usize,

    /// Allows physical full builds via the file-stream copy protocol.
    pub enable_file_stream_full_copy: bool,

    /// Builders queued behind an active backup before falling back to
    /// logical full copy.
    pub max_file_stream_full_copy_waiters: usize,

    /// Default commit timeout, in milliseconds. Zero means wait forever.
    pub commit_timeout_ms: u64,

    /// Byte budget for a simple transaction group before it force-commits.
    pub simple_transaction_group_size_limit: usize,

    /// Replication queue depth ceilings driving the batch throttle. Zero
    /// disables the respective check.
    pub throttle_queued_bytes_ceiling: u64,
    pub throttle_queued_ops_ceiling: u64,

    /// Refresh throttle counters every N completed replications.
    pub throttle_refresh_operation_count: u64,

    /// Periodic throttle counter refresh, in milliseconds. Zero disables the
    /// timer and counters refresh only on completion counts.
    pub throttle_refresh_interval_ms: u64,

    /// Logical-time persistence interval while primary, in milliseconds.
    pub fabric_time_refresh_interval_ms: u64,

    /// Issue a flush transaction after draining ready commits.
    pub enable_flush_on_drain: bool,

    /// Compact the store log on open when garbage exceeds this ratio.
    pub log_garbage_ratio_threshold: f64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            target_copy_operation_size: 2 * 1024 * 1024,
            max_epoch_history_count: 32,
            tombstone_cleanup_limit: 10_000,
            tombstone_prune_batch: 1024,
            secondary_apply_retry_count: 5,
            secondary_apply_retry_delay_ms: 50,
            max_wait_for_copy_lsn_retry: 20,
            copy_lsn_wait_delay_ms: 100,
            slow_commit_trace_threshold_ms: 1_000,
            slow_commit_count_threshold: 16,
            enable_file_stream_full_copy: false,
            max_file_stream_full_copy_waiters: 4,
            commit_timeout_ms: 0,
            simple_transaction_group_size_limit: 1024 * 1024,
            throttle_queued_bytes_ceiling: 0,
            throttle_queued_ops_ceiling: 0,
            throttle_refresh_operation_count: 64,
            throttle_refresh_interval_ms: 0,
            fabric_time_refresh_interval_ms: 5_000,
            enable_flush_on_drain: true,
            log_garbage_ratio_threshold: 0.2,
        }
    }
}

impl StoreSettings {
    /// Loads settings from a JSON file, filling missing fields with defaults.
    pub fn load(path: &Path) -> CResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| Error::Parse(err.to_string()))
    }

    pub fn slow_commit_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slow_commit_trace_threshold_ms)
    }

    pub fn commit_timeout(&self) -> Option<std::time::Duration> {
        if self.commit_timeout_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.commit_timeout_ms))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = StoreSettings::default();
        assert!(s.target_copy_operation_size > 0);
        assert!(s.max_epoch_history_count >= 2);
        assert!(s.commit_timeout().is_none());
    }

    #[test]
    fn partial_settings_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "tombstone_cleanup_limit": 7 }"#).unwrap();

        let s = StoreSettings::load(&path).unwrap();
        assert_eq!(s.tombstone_cleanup_limit, 7);
        assert_eq!(
            s.target_copy_operation_size,
            StoreSettings::default().target_copy_operation_size
        );
    }
}
