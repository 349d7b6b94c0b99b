//! Memory-mapped paged storage.

use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{PagedStorage, StorageLockContext, open_storage_file};
use crate::errors::{StorageError, StorageResult};

/// Paged storage over a read-write memory map of the whole file.
///
/// The file is extended (doubling) and remapped when a page beyond the
/// mapping is touched. Page writes take the mapping's write lock, so writers
/// are serialized regardless of the locking strategy; readers share it.
pub struct MmapPagedStorage {
    file: File,
    path: PathBuf,
    page_size: usize,
    map: RwLock<MmapMut>,
    lock_context: Arc<StorageLockContext>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl MmapPagedStorage {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        lock_context: Arc<StorageLockContext>,
        create_if_missing: bool,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = open_storage_file(path, create_if_missing)?;

        // Map whole pages, and never an empty file
        let file_len = file.metadata()?.len();
        let mapped_len = file_len.div_ceil(page_size as u64).max(1) * page_size as u64;
        if mapped_len != file_len {
            file.set_len(mapped_len)?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file may be modified
        // externally while mapped. The storage file is owned by this process
        // for as long as it is open, and every access goes through
        // with_page/with_page_mut which bounds-check against the mapping.
        let map = unsafe { MmapMut::map_mut(&file)? };

        debug!(
            path = %path.display(),
            page_size,
            mapped_len,
            "opened mmap storage"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            map: RwLock::new(map),
            lock_context,
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn page_range(&self, page_no: u64) -> (usize, usize) {
        let start = page_no as usize * self.page_size;
        (start, start + self.page_size)
    }

    fn ensure_mapped(&self, page_no: u64) -> StorageResult<()> {
        let required = (page_no + 1) * self.page_size as u64;
        if required <= self.map.read().len() as u64 {
            return Ok(());
        }

        let mut map = self.map.write();
        let current = map.len() as u64;
        if required <= current {
            return Ok(());
        }
        let new_len = required.max(current * 2);

        map.flush()?;
        self.file.set_len(new_len)?;
        // SAFETY: the old mapping is replaced while the write lock is held, so
        // no page slice borrowed from it is alive. The file was extended to
        // new_len before remapping.
        *map = unsafe { MmapMut::map_mut(&self.file)? };

        debug!(path = %self.path.display(), from = current, to = new_len, "grew mapping");
        Ok(())
    }
}

impl PagedStorage for MmapPagedStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn page_count(&self) -> u64 {
        self.map.read().len() as u64 / self.page_size as u64
    }

    fn with_page<R>(&self, page_no: u64, reader: impl FnOnce(&[u8]) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_read();
        self.ensure_mapped(page_no)?;
        let map = self.map.read();
        let (start, end) = self.page_range(page_no);
        Ok(reader(&map[start..end]))
    }

    fn with_page_mut<R>(&self, page_no: u64, writer: impl FnOnce(&mut [u8]) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_write();
        self.ensure_mapped(page_no)?;
        let mut map = self.map.write();
        let (start, end) = self.page_range(page_no);
        self.dirty.store(true, Ordering::Release);
        Ok(writer(&mut map[start..end]))
    }

    fn flush(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_write();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.map.read().flush() {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), "flushed mapping");
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn close(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MmapPagedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapPagedStorage")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("mapped_len", &self.map.read().len())
            .field("locking", &self.lock_context.strategy())
            .finish()
    }
}
