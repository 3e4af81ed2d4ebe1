use std::path::Path;
use std::sync::Arc;

use crate::error::CResult;
use crate::storage::{SnapshotMap, Status};

/// Builds an engine rooted at a directory. Replicas use this to stage side
/// stores during snapshot builds and to rebuild from extracted backups.
pub type EngineFactory = Arc<dyn Fn(&Path) -> CResult<Box<dyn Engine>> + Send + Sync>;

/// A key/value storage engine, where both keys and values are arbitrary byte
/// strings stored in lexicographical key order. Writes are only guaranteed
/// durable after calling flush().
///
/// All methods take a mutable reference; the caller serializes access (the
/// local store keeps the engine behind a mutex and hands out immutable
/// snapshots for reads).
pub trait Engine: std::fmt::Display + Send {
    /// Gets a value for a key, if it exists.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    /// Applies a write set atomically: Some(value) upserts, None deletes.
    /// Either every write is visible afterwards or none is.
    fn apply_batch(&mut self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> CResult<()>;

    /// Returns an immutable point-in-time view of the full contents.
    fn snapshot(&mut self) -> CResult<SnapshotMap>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Writes a self-contained, compacted copy of the live contents into the
    /// given directory, for use by physical full builds.
    fn backup(&mut self, dir: &Path) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;
}
