//! Page cache over positional file I/O.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::{PagedStorage, StorageLockContext, open_storage_file};
use crate::errors::{StorageError, StorageResult};

struct Page {
    data: Box<[u8]>,
    dirty: bool,
}

/// Paged storage keeping every touched page in memory.
///
/// Pages are loaded lazily with `pread` and written back with `pwrite` on
/// [`flush`](PagedStorage::flush). Pages are never evicted, so memory grows
/// with the part of the file that was accessed.
pub struct FilePagedStorage {
    file: File,
    path: PathBuf,
    page_size: usize,
    /// Pages present in the file when it was opened
    file_pages: u64,
    pages: RwLock<AHashMap<u64, Arc<RwLock<Page>>>>,
    lock_context: Arc<StorageLockContext>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl FilePagedStorage {
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        lock_context: Arc<StorageLockContext>,
        create_if_missing: bool,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = open_storage_file(path, create_if_missing)?;
        let file_len = file.metadata()?.len();
        let file_pages = file_len.div_ceil(page_size as u64);

        debug!(
            path = %path.display(),
            page_size,
            file_pages,
            "opened page cache storage"
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            file_pages,
            pages: RwLock::new(AHashMap::new()),
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

    fn page(&self, page_no: u64) -> StorageResult<Arc<RwLock<Page>>> {
        if let Some(page) = self.pages.read().get(&page_no) {
            return Ok(Arc::clone(page));
        }

        let mut pages = self.pages.write();
        if let Some(page) = pages.get(&page_no) {
            return Ok(Arc::clone(page));
        }
        let page = Arc::new(RwLock::new(self.load_page(page_no)?));
        pages.insert(page_no, Arc::clone(&page));
        Ok(page)
    }

    fn load_page(&self, page_no: u64) -> StorageResult<Page> {
        let mut data = vec![0u8; self.page_size].into_boxed_slice();
        if page_no < self.file_pages {
            let offset = page_no * self.page_size as u64;
            let mut filled = 0;
            while filled < data.len() {
                match self.file.read_at(&mut data[filled..], offset + filled as u64) {
                    // Short file tail reads as zeros
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(Page { data, dirty: false })
    }

    fn flush_pages(&self) -> StorageResult<usize> {
        let mut snapshot: Vec<(u64, Arc<RwLock<Page>>)> = self
            .pages
            .read()
            .iter()
            .map(|(page_no, page)| (*page_no, Arc::clone(page)))
            .collect();
        snapshot.sort_unstable_by_key(|(page_no, _)| *page_no);

        let mut written = 0;
        for (page_no, page) in snapshot {
            let mut page = page.write();
            if !page.dirty {
                continue;
            }
            self.file
                .write_all_at(&page.data, page_no * self.page_size as u64)?;
            page.dirty = false;
            written += 1;
        }
        Ok(written)
    }
}

impl PagedStorage for FilePagedStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn page_count(&self) -> u64 {
        let cached = self
            .pages
            .read()
            .keys()
            .max()
            .map(|page_no| page_no + 1)
            .unwrap_or(0);
        cached.max(self.file_pages)
    }

    fn with_page<R>(&self, page_no: u64, reader: impl FnOnce(&[u8]) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_read();
        let page = self.page(page_no)?;
        let page = page.read();
        Ok(reader(&page.data))
    }

    fn with_page_mut<R>(&self, page_no: u64, writer: impl FnOnce(&mut [u8]) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_write();
        let page = self.page(page_no)?;
        let mut page = page.write();
        page.dirty = true;
        self.dirty.store(true, Ordering::Release);
        Ok(writer(&mut page.data))
    }

    fn flush(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let _storage = self.lock_context.lock_for_write();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush_pages().and_then(|written| {
            self.file.sync_data()?;
            Ok(written)
        });
        match flushed {
            Ok(written) => {
                debug!(path = %self.path.display(), written, "flushed dirty pages");
                Ok(())
            }
            Err(e) => {
                // Pages not written keep their own dirty flag
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
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
        self.pages.write().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for FilePagedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePagedStorage")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("cached_pages", &self.pages.read().len())
            .field("locking", &self.lock_context.strategy())
            .finish()
    }
}
