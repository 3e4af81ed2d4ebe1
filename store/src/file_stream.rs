//! Physical full builds.
//!
//! The file-stream copy protocol takes a backup of the local store, packs
//! the backup directory into a single archive file, and streams that archive
//! to the idle secondary in chunks. Only one backup runs at a time per
//! store; parallel builds queue behind the active backup and reuse any
//! archive whose LSN is sufficiently advanced. On the secondary the chunks
//! are reassembled, extracted into a staging directory, and the store is
//! rebuilt from it.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::sync::{Mutex, Notify};

use crate::error::{CResult, Error};
use crate::local::{LocalStore, Lsn, SharedLocalStore};
use crate::wire::FileStreamCopyOperationData;

const ARCHIVE_MAGIC: u32 = 0x424b_4152; // "BKAR"

/// Packs every file under `src_dir` (recursively, relative paths) into one
/// archive file. Entries are `[path_len u32][path][data_len u64][data]`.
pub fn write_archive(src_dir: &Path, archive_path: &Path) -> CResult<()> {
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(archive_path)?;
    let mut w = BufWriter::new(file);
    w.write_u32::<BigEndian>(ARCHIVE_MAGIC)?;

    let mut stack = vec![src_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(src_dir)
                .map_err(|err| Error::Internal(err.to_string()))?
                .to_string_lossy()
                .into_owned();
            let data = std::fs::read(&path)?;

            w.write_u32::<BigEndian>(relative.len() as u32)?;
            w.write_all(relative.as_bytes())?;
            w.write_u64::<BigEndian>(data.len() as u64)?;
            w.write_all(&data)?;
        }
    }

    w.flush()?;
    w.into_inner()
        .map_err(|err| Error::Internal(err.to_string()))?
        .sync_all()?;
    Ok(())
}

/// Unpacks an archive produced by [`write_archive`] into `dst_dir`.
pub fn extract_archive(archive_path: &Path, dst_dir: &Path) -> CResult<()> {
    std::fs::create_dir_all(dst_dir)?;
    let file = std::fs::File::open(archive_path)?;
    let len = file.metadata()?.len();
    let mut r = BufReader::new(file);

    if r.read_u32::<BigEndian>()? != ARCHIVE_MAGIC {
        return Err(Error::Parse("bad archive magic".to_string()));
    }

    let mut pos = 4u64;
    while pos < len {
        let path_len = r.read_u32::<BigEndian>()? as usize;
        let mut path_bytes = vec![0; path_len];
        r.read_exact(&mut path_bytes)?;
        let relative = String::from_utf8(path_bytes)?;
        if relative.contains("..") {
            return Err(Error::Parse(format!("unsafe archive path '{}'", relative)));
        }

        let data_len = r.read_u64::<BigEndian>()? as usize;
        let mut data = vec![0; data_len];
        r.read_exact(&mut data)?;

        let target = dst_dir.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &data)?;

        pos += 4 + path_len as u64 + 8 + data_len as u64;
    }
    Ok(())
}

/// Reader over one archive file, shared by a single builder.
pub struct FileStreamFullCopyContext {
    archive_lsn: Lsn,
    file: std::fs::File,
    file_size: u64,
    total_bytes_read: u64,
}

impl FileStreamFullCopyContext {
    fn open(archive_path: &Path, archive_lsn: Lsn) -> CResult<Self> {
        let file = std::fs::File::open(archive_path)?;
        let file_size = file.metadata()?.len();
        Ok(FileStreamFullCopyContext { archive_lsn, file, file_size, total_bytes_read: 0 })
    }

    pub fn lsn(&self) -> Lsn {
        self.archive_lsn
    }

    /// Next chunk of at most `target_size` bytes. `is_last_chunk` is set on
    /// the chunk that reaches the end of the archive.
    pub fn read_next_chunk(
        &mut self,
        is_first_chunk: bool,
        target_size: usize,
    ) -> CResult<FileStreamCopyOperationData> {
        let remaining = self.file_size - self.total_bytes_read;
        let take = remaining.min(target_size.max(1) as u64) as usize;

        let mut bytes = vec![0; take];
        self.file.seek(SeekFrom::Start(self.total_bytes_read))?;
        self.file.read_exact(&mut bytes)?;
        self.total_bytes_read += take as u64;

        Ok(FileStreamCopyOperationData {
            is_first_chunk,
            is_last_chunk: self.total_bytes_read >= self.file_size,
            bytes,
            operation_lsn: self.archive_lsn,
        })
    }
}

struct ArchiveFileContext {
    lsn: Lsn,
    path: PathBuf,
    active_readers: usize,
}

struct ManagerState {
    backup_active: bool,
    waiters: usize,
    archives: Vec<ArchiveFileContext>,
    archive_sequence: u64,
}

/// Matches build requests to existing backups, queueing extra backup
/// attempts behind the active one and cleaning up archives nobody reads.
pub struct FileStreamFullCopyManager {
    store: SharedLocalStore,
    work_dir: PathBuf,
    max_waiters: usize,
    state: Mutex<ManagerState>,
    backup_done: Notify,
}

impl FileStreamFullCopyManager {
    pub fn new(store: SharedLocalStore, work_dir: PathBuf, max_waiters: usize) -> Arc<Self> {
        Arc::new(FileStreamFullCopyManager {
            store,
            work_dir,
            max_waiters,
            state: Mutex::new(ManagerState {
                backup_active: false,
                waiters: 0,
                archives: Vec::new(),
                archive_sequence: 0,
            }),
            backup_done: Notify::new(),
        })
    }

    /// Acquires an archive reader at or past `up_to_lsn`, producing a new
    /// backup when none is available. Fails with
    /// `MaxFileStreamFullCopyWaiters` when too many builders already queue
    /// behind the active backup; the caller falls back to logical full copy.
    pub async fn get_copy_context(&self, up_to_lsn: Lsn) -> CResult<FileStreamFullCopyContext> {
        loop {
            let sequence = {
                let mut state = self.state.lock().await;

                if let Some(existing) =
                    state.archives.iter_mut().find(|a| a.lsn >= up_to_lsn)
                {
                    existing.active_readers += 1;
                    return FileStreamFullCopyContext::open(&existing.path, existing.lsn);
                }

                if state.backup_active {
                    if state.waiters >= self.max_waiters {
                        return Err(Error::MaxFileStreamFullCopyWaiters);
                    }
                    state.waiters += 1;
                    drop(state);

                    // Poll-bounded wait: a notify between the lock release
                    // and the first poll of notified() would otherwise be
                    // lost.
                    let _ = tokio::time::timeout(
                        std::time::Duration::from_millis(50),
                        self.backup_done.notified(),
                    )
                    .await;

                    let mut state = self.state.lock().await;
                    state.waiters -= 1;
                    continue;
                }

                state.backup_active = true;
                state.archive_sequence += 1;
                state.archive_sequence
            };

            let result = self.run_backup(sequence).await;

            {
                let mut state = self.state.lock().await;
                state.backup_active = false;
                if let Ok(context) = &result {
                    state.archives.push(ArchiveFileContext {
                        lsn: context.0,
                        path: context.1.clone(),
                        active_readers: 0,
                    });
                }
            }
            self.backup_done.notify_waiters();

            result?;
        }
    }

    /// Releases an archive reader. Archives with no readers are deleted once
    /// a newer archive exists.
    pub async fn release_copy_context(&self, context: FileStreamFullCopyContext) {
        let mut state = self.state.lock().await;
        let newest = state.archives.iter().map(|a| a.lsn).max().unwrap_or(0);

        if let Some(ix) = state.archives.iter().position(|a| a.lsn == context.archive_lsn) {
            let archive = &mut state.archives[ix];
            archive.active_readers = archive.active_readers.saturating_sub(1);
            if archive.active_readers == 0 && archive.lsn < newest {
                let stale = state.archives.remove(ix);
                log::info!("removing stale backup archive {}", stale.path.display());
                if let Err(err) = std::fs::remove_file(&stale.path) {
                    log::warn!("failed to remove {}: {}", stale.path.display(), err);
                }
            }
        }
    }

    async fn run_backup(&self, sequence: u64) -> CResult<(Lsn, PathBuf)> {
        let backup_dir = self.work_dir.join(format!("backup-{}", sequence));
        let archive_path = self.work_dir.join(format!("archive-{}.bkar", sequence));

        // Blocking file IO on the backup path runs off the async workers.
        let store: LocalStore = match self.store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let dir = backup_dir.clone();
        let archive = archive_path.clone();
        let lsn = tokio::task::spawn_blocking(move || -> CResult<Lsn> {
            std::fs::create_dir_all(&dir)?;
            store.backup(&dir)?;
            let lsn = store.last_change_operation_lsn();
            write_archive(&dir, &archive)?;
            std::fs::remove_dir_all(&dir)?;
            Ok(lsn)
        })
        .await
        .map_err(|err| Error::Internal(err.to_string()))??;

        log::info!(
            "file stream backup {} complete at lsn {}: {}",
            sequence,
            lsn,
            archive_path.display()
        );
        Ok((lsn, archive_path))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::memory::Memory;

    #[test]
    fn archive_round_trips_nested_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.log"), b"alpha").unwrap();
        std::fs::write(src.path().join("sub/b.log"), b"beta").unwrap();

        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("out.bkar");
        write_archive(src.path(), &archive).unwrap();

        let dst = tempfile::tempdir().unwrap();
        extract_archive(&archive, dst.path()).unwrap();

        assert_eq!(std::fs::read(dst.path().join("a.log")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dst.path().join("sub/b.log")).unwrap(), b"beta");
    }

    #[test]
    fn chunked_reads_cover_the_archive_exactly() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("data.log"), vec![7u8; 3000]).unwrap();

        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("out.bkar");
        write_archive(src.path(), &archive).unwrap();

        let mut context = FileStreamFullCopyContext::open(&archive, 9).unwrap();
        let mut total = 0;
        let mut first = true;
        loop {
            let chunk = context.read_next_chunk(first, 1024).unwrap();
            assert_eq!(chunk.is_first_chunk, first);
            assert_eq!(chunk.operation_lsn, 9);
            total += chunk.bytes.len();
            first = false;
            if chunk.is_last_chunk {
                break;
            }
        }
        assert_eq!(total as u64, std::fs::metadata(&archive).unwrap().len());
    }

    #[tokio::test]
    async fn manager_reuses_a_sufficiently_advanced_archive() -> CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;
        let mut tx = store.create_transaction()?;
        tx.insert("T", "k", b"v", 5, None)?;
        tx.commit()?;

        let work = tempfile::tempdir().unwrap();
        let shared: SharedLocalStore = Arc::new(std::sync::RwLock::new(store));
        let manager =
            FileStreamFullCopyManager::new(shared, work.path().to_path_buf(), 2);

        let first = manager.get_copy_context(5).await?;
        assert_eq!(first.lsn(), 5);

        // Second builder at the same LSN reuses the archive: no new backup.
        let second = manager.get_copy_context(5).await?;
        assert_eq!(second.lsn(), 5);
        assert_eq!(manager.state.lock().await.archive_sequence, 1);

        manager.release_copy_context(first).await;
        manager.release_copy_context(second).await;
        Ok(())
    }

    #[tokio::test]
    async fn extracted_backup_rebuilds_a_store() -> CResult<()> {
        let store = LocalStore::open(Box::new(Memory::new()))?;
        let mut tx = store.create_transaction()?;
        tx.insert("T", "k1", b"v1", 3, None)?;
        tx.insert("T", "k2", b"v2", 4, None)?;
        tx.commit()?;

        let work = tempfile::tempdir().unwrap();
        let shared: SharedLocalStore = Arc::new(std::sync::RwLock::new(store));
        let manager =
            FileStreamFullCopyManager::new(shared, work.path().to_path_buf(), 2);
        let mut context = manager.get_copy_context(4).await?;

        // Reassemble chunks the way the secondary pump does.
        let staged = tempfile::tempdir().unwrap();
        let archive = staged.path().join("incoming.bkar");
        let mut out = std::fs::File::create(&archive).unwrap();
        let mut first = true;
        loop {
            let chunk = context.read_next_chunk(first, 512).unwrap();
            use std::io::Write;
            out.write_all(&chunk.bytes).unwrap();
            first = false;
            if chunk.is_last_chunk {
                break;
            }
        }
        drop(out);

        let extract_dir = staged.path().join("extracted");
        extract_archive(&archive, &extract_dir)?;

        let rebuilt = LocalStore::open(Box::new(
            crate::storage::log_store::LogStore::open(&extract_dir)?,
        ))?;
        let tx = rebuilt.create_transaction()?;
        assert_eq!(tx.read_exact("T", "k1")?, (b"v1".to_vec(), 3));
        assert_eq!(tx.read_exact("T", "k2")?, (b"v2".to_vec(), 4));
        assert_eq!(rebuilt.last_change_operation_lsn(), 4);
        Ok(())
    }
}
