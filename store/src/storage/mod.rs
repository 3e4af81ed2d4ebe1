pub mod engine;
pub mod log;
pub mod log_store;
pub mod memory;

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;

const CURRENT_POINTER: &str = "CURRENT";
const DEFAULT_STORE_DIR: &str = "store";

/// Name (relative to the replica data directory) of the live store
/// directory. Builds that complete on a side store repoint this.
pub fn read_current_store_dir(data_dir: &Path) -> String {
    match std::fs::read_to_string(data_dir.join(CURRENT_POINTER)) {
        Ok(name) => {
            let name = name.trim();
            if name.is_empty() {
                DEFAULT_STORE_DIR.to_string()
            } else {
                name.to_string()
            }
        }
        Err(_) => DEFAULT_STORE_DIR.to_string(),
    }
}

/// Atomically repoints the live store directory.
pub fn write_current_store_dir(data_dir: &Path, name: &str) -> CResult<()> {
    std::fs::create_dir_all(data_dir)?;
    let tmp = data_dir.join(format!("{}.tmp", CURRENT_POINTER));
    std::fs::write(&tmp, name)?;
    std::fs::rename(&tmp, data_dir.join(CURRENT_POINTER))?;
    Ok(())
}

/// An immutable, ordered point-in-time view of the engine contents.
/// Cloning is O(1) thanks to structural sharing, which is what makes
/// snapshot-isolated reads and long copy enumerations cheap.
pub type SnapshotMap = im::OrdMap<Vec<u8>, Vec<u8>>;

/// Engine status, reported for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys in the engine.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}
