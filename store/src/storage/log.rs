use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::SnapshotMap;

/// A deletion is framed with this value in place of the value length.
const DELETE_MARKER: i32 = -1;

/// An append-only log file, containing a sequence of key/value frames:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for deletions.
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

/// Serialized size of one frame.
fn frame_len(key: &[u8], value: Option<&[u8]>) -> u64 {
    4 + 4 + key.len() as u64 + value.map_or(0, |v| v.len() as u64)
}

/// Writes one frame. The caller batches and flushes.
fn write_frame<W: Write>(w: &mut W, key: &[u8], value: Option<&[u8]>) -> CResult<()> {
    w.write_u32::<BigEndian>(key.len() as u32)?;
    match value {
        Some(value) => w.write_i32::<BigEndian>(value.len() as i32)?,
        None => w.write_i32::<BigEndian>(DELETE_MARKER)?,
    }
    w.write_all(key)?;
    if let Some(value) = value {
        w.write_all(value)?;
    }
    Ok(())
}

/// Reads the frame starting at `pos`. A frame whose value would run past
/// `file_len` reports `UnexpectedEof` so the caller can treat it as a torn
/// tail.
fn read_frame<R: Read>(
    r: &mut R,
    pos: u64,
    file_len: u64,
) -> std::io::Result<(Vec<u8>, Option<Vec<u8>>)> {
    let key_len = r.read_u32::<BigEndian>()?;
    let value_len = r.read_i32::<BigEndian>()?;

    let mut key = vec![0; key_len as usize];
    r.read_exact(&mut key)?;

    if value_len < 0 {
        return Ok((key, None));
    }
    if pos + 4 + 4 + key_len as u64 + value_len as u64 > file_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "value extends beyond end of file",
        ));
    }
    let mut value = vec![0; value_len as usize];
    r.read_exact(&mut value)?;
    Ok((key, Some(value)))
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file until it is closed, or errors if the lock
    /// is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("{}:{:?}", err, dir.to_str())))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if try_lock {
            file.try_lock_exclusive()?;
        }

        Ok(Self { path, file })
    }

    /// Replays the log into an ordered map of live entries, returning the map
    /// and the total byte size of the live entries on disk.
    ///
    /// If an incomplete frame is found at the end of the file, it is assumed
    /// to be an interrupted write and the file is truncated at that point.
    pub fn build_index(&mut self) -> CResult<(SnapshotMap, u64)> {
        let mut index = SnapshotMap::new();
        let mut entry_sizes: std::collections::BTreeMap<Vec<u8>, u64> =
            std::collections::BTreeMap::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);

        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            match read_frame(&mut r, pos, file_len) {
                Ok((key, value)) => {
                    pos += frame_len(&key, value.as_deref());
                    match value {
                        Some(value) => {
                            entry_sizes.insert(key.clone(), frame_len(&key, Some(&value)));
                            index.insert(key, value);
                        }
                        None => {
                            entry_sizes.remove(&key);
                            index.remove(&key);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("Found incomplete frame at offset {}, truncating file", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let live_size = entry_sizes.values().sum();
        Ok((index, live_size))
    }

    /// Appends a key/value entry to the log file, using a None value for
    /// deletions. Returns the position and length of the entry.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let pos = self.file.seek(SeekFrom::End(0))?;

        let mut w = BufWriter::new(&mut self.file);
        write_frame(&mut w, key, value)?;
        w.flush()?;

        Ok((pos, frame_len(key, value) as u32))
    }

    /// Appends many entries with a single buffered writer flush.
    pub fn write_batch(&mut self, entries: &[(Vec<u8>, Option<Vec<u8>>)]) -> CResult<()> {
        self.file.seek(SeekFrom::End(0))?;

        let mut w = BufWriter::new(&mut self.file);
        for (key, value) in entries {
            write_frame(&mut w, key, value.as_deref())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Durably syncs the log to disk.
    pub fn sync(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    pub fn disk_size(&self) -> CResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replay_recovers_live_entries_and_truncates_torn_tail() {
        let dir = tempdir::TempDir::new("logtest").unwrap();
        let path = dir.path().join("store.log");

        {
            let mut log = Log::new(path.clone()).unwrap();
            log.write_entry(b"a", Some(b"1")).unwrap();
            log.write_entry(b"b", Some(b"2")).unwrap();
            log.write_entry(b"a", Some(b"3")).unwrap();
            log.write_entry(b"b", None).unwrap();
            log.sync().unwrap();

            // Simulate a torn write: a partial header at the tail.
            use std::io::Write;
            log.file.write_all(&[0x00, 0x00]).unwrap();
            log.sync().unwrap();
        }

        let mut log = Log::new(path.clone()).unwrap();
        let (index, live) = log.build_index().unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(b"a".as_slice()), Some(&b"3".to_vec()));
        assert!(live > 0);

        // The torn tail was truncated away.
        let len_after = log.disk_size().unwrap();
        let mut log2 = Log::new_with_lock(path, false).unwrap();
        let (index2, _) = log2.build_index().unwrap();
        assert_eq!(index, index2);
        assert_eq!(len_after, log2.disk_size().unwrap());
    }

    #[test]
    fn batch_write_round_trips() {
        let dir = tempdir::TempDir::new("logtest").unwrap();
        let mut log = Log::new(dir.path().join("store.log")).unwrap();

        log.write_batch(&[
            (b"x".to_vec(), Some(b"10".to_vec())),
            (b"y".to_vec(), Some(b"20".to_vec())),
            (b"x".to_vec(), None),
        ])
        .unwrap();

        let (index, _) = log.build_index().unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(b"y".as_slice()), Some(&b"20".to_vec()));
    }
}
