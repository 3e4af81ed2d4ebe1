use std::path::{Path, PathBuf};

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{SnapshotMap, Status};

/// A durable engine: an ordered in-memory map backed by an append-only log.
///
/// All live entries are kept in memory for reads and snapshots; every write
/// is appended to the log before it becomes visible. On open the log is
/// replayed to rebuild the map, and replaced entries accumulate as garbage
/// until compaction rewrites the log with live data only.
pub struct LogStore {
    log: Log,
    data: SnapshotMap,
    live_size: u64,
}

impl LogStore {
    /// Opens or creates a LogStore whose log lives in the given directory.
    pub fn open(dir: &Path) -> CResult<Self> {
        Self::open_file(dir.join("store.log"))
    }

    pub fn open_file(path: PathBuf) -> CResult<Self> {
        let mut log = Log::new(path)?;
        let (data, live_size) = log.build_index()?;
        Ok(Self { log, data, live_size })
    }

    /// Opens a LogStore and compacts it if the amount of garbage exceeds the
    /// given ratio.
    pub fn open_compact(dir: &Path, garbage_ratio_threshold: f64) -> CResult<Self> {
        let mut s = Self::open(dir)?;

        let status = s.status()?;
        if status.total_disk_size > 0 {
            let garbage_ratio = status.garbage_disk_size as f64 / status.total_disk_size as f64;
            if status.garbage_disk_size > 0 && garbage_ratio >= garbage_ratio_threshold {
                log::info!(
                    "Compacting {} to remove {:.3}MB garbage ({:.0}% of {:.3}MB)",
                    s.log.path.display(),
                    status.garbage_disk_size / 1024 / 1024,
                    garbage_ratio * 100.0,
                    status.total_disk_size / 1024 / 1024
                );
                s.compact()?;
            }
        }

        Ok(s)
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    /// Rewrites the log with live entries only.
    pub fn compact(&mut self) -> CResult<()> {
        let tmp_path = self.log.path.with_extension("new");
        let mut new_log = Log::new(tmp_path)?;

        let mut live_size = 0;
        for (key, value) in self.data.iter() {
            let (_, len) = new_log.write_entry(key, Some(value))?;
            live_size += len as u64;
        }
        new_log.sync()?;

        // Atomically replace the old log with the compacted one.
        let old_path = self.log.path.clone();
        std::fs::rename(&new_log.path, &old_path)?;
        new_log.path = old_path;

        self.log = new_log;
        self.live_size = live_size;
        Ok(())
    }

    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<()> {
        let (_, len) = self.log.write_entry(key, value)?;
        match value {
            Some(value) => {
                self.data.insert(key.to_vec(), value.to_vec());
                self.live_size += len as u64;
            }
            None => {
                self.data.remove(key);
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "log store")
    }
}

impl Engine for LogStore {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.append(key, Some(&value))
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.append(key, None)
    }

    fn apply_batch(&mut self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> CResult<()> {
        self.log.write_batch(&writes)?;
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.live_size += (8 + key.len() + value.len()) as u64;
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&mut self) -> CResult<SnapshotMap> {
        Ok(self.data.clone())
    }

    fn flush(&mut self) -> CResult<()> {
        self.log.sync()
    }

    fn backup(&mut self, dir: &Path) -> CResult<()> {
        let mut backup_log = Log::new(dir.join("store.log"))?;
        for (key, value) in self.data.iter() {
            backup_log.write_entry(key, Some(value))?;
        }
        backup_log.sync()
    }

    fn status(&mut self) -> CResult<Status> {
        let total_disk_size = self.log.disk_size()?;
        Ok(Status {
            name: self.to_string(),
            keys: self.data.len() as u64,
            size: self
                .data
                .iter()
                .fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
            total_disk_size,
            live_disk_size: self.live_size,
            garbage_disk_size: total_disk_size.saturating_sub(self.live_size),
        })
    }
}
