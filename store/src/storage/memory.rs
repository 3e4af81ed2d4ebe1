use std::path::Path;

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::log::Log;
use crate::storage::{SnapshotMap, Status};

/// A volatile engine: keys and values live in an ordered structural-sharing
/// map, so snapshots are O(1) clones. Nothing is persisted; `backup` is the
/// only way contents reach disk.
pub struct Memory {
    data: SnapshotMap,
}

impl Memory {
    /// Creates a Memory key-value storage engine.
    pub fn new() -> Self {
        Self { data: SnapshotMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory")
    }
}

impl Engine for Memory {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.data.remove(key);
        Ok(())
    }

    fn apply_batch(&mut self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> CResult<()> {
        for (key, value) in writes {
            match value {
                Some(value) => {
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
        Ok(())
    }

    fn backup(&mut self, dir: &Path) -> CResult<()> {
        let mut log = Log::new(dir.join("store.log"))?;
        for (key, value) in self.data.iter() {
            log.write_entry(key, Some(value))?;
        }
        log.sync()
    }

    fn status(&mut self) -> CResult<Status> {
        Ok(Status {
            name: self.to_string(),
            keys: self.data.len() as u64,
            size: self
                .data
                .iter()
                .fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> CResult<()> {
        let mut s = Memory::new();

        assert_eq!(s.get(b"a")?, None);

        s.set(b"a", vec![1])?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"b", vec![2])?;
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"a", vec![0])?;
        assert_eq!(s.get(b"a")?, Some(vec![0]));

        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);
        assert_eq!(s.get(b"b")?, Some(vec![2]));

        // Deletes are idempotent.
        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);

        Ok(())
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() -> CResult<()> {
        let mut s = Memory::new();
        s.set(b"a", vec![1])?;

        let snap = s.snapshot()?;
        s.set(b"a", vec![2])?;
        s.set(b"b", vec![3])?;

        assert_eq!(snap.get(b"a".as_slice()), Some(&vec![1]));
        assert_eq!(snap.get(b"b".as_slice()), None);
        assert_eq!(s.get(b"a")?, Some(vec![2]));

        Ok(())
    }

    #[test]
    fn batch_applies_upserts_and_deletes() -> CResult<()> {
        let mut s = Memory::new();
        s.set(b"a", vec![1])?;
        s.set(b"b", vec![2])?;

        s.apply_batch(vec![
            (b"a".to_vec(), None),
            (b"c".to_vec(), Some(vec![3])),
        ])?;

        assert_eq!(s.get(b"a")?, None);
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"c")?, Some(vec![3]));

        Ok(())
    }
}
