//! Paged storage backends.
//!
//! The blob storage sees its file as a sequence of fixed-size pages and only
//! ever touches bytes through [`PagedStorage::with_page`] and
//! [`PagedStorage::with_page_mut`]. Pages are created zero-filled on first
//! access. Two backends are provided:
//!
//! - [`FilePagedStorage`]: page cache over positional file I/O
//! - [`MmapPagedStorage`]: memory-mapped file that grows by remapping
//!
//! Locking is decided by a [`StorageLockContext`] handed in at construction.
//! With [`LockingStrategy::WholeStorage`] every page access additionally
//! takes one storage-wide read/write lock; with [`LockingStrategy::PerPage`]
//! only the page's own lock is taken.

mod mmap;
mod page_cache;

pub use mmap::MmapPagedStorage;
pub use page_cache::FilePagedStorage;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use super::constants::FILE_PERMISSIONS;
use crate::errors::StorageResult;

/// How page accesses are serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockingStrategy {
    /// Each page has its own lock; different pages are accessed concurrently
    #[default]
    PerPage,
    /// One lock for the whole storage on top of the page locks
    WholeStorage,
}

/// Lock context of a paged storage.
///
/// Several storages may share one context through `Arc` so that a
/// `WholeStorage` lock spans all of them.
#[derive(Debug, Default)]
pub struct StorageLockContext {
    strategy: LockingStrategy,
    storage_lock: RwLock<()>,
}

impl StorageLockContext {
    pub fn new(strategy: LockingStrategy) -> Self {
        Self {
            strategy,
            storage_lock: RwLock::new(()),
        }
    }

    pub fn shared(strategy: LockingStrategy) -> Arc<Self> {
        Arc::new(Self::new(strategy))
    }

    pub fn strategy(&self) -> LockingStrategy {
        self.strategy
    }

    pub(crate) fn lock_for_read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        match self.strategy {
            LockingStrategy::WholeStorage => Some(self.storage_lock.read()),
            LockingStrategy::PerPage => None,
        }
    }

    pub(crate) fn lock_for_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        match self.strategy {
            LockingStrategy::WholeStorage => Some(self.storage_lock.write()),
            LockingStrategy::PerPage => None,
        }
    }
}

/// Fixed-size page access to a storage file.
///
/// Closures passed to `with_page`/`with_page_mut` run while the page lock is
/// held and must not call back into the same storage.
pub trait PagedStorage: Send + Sync {
    fn page_size(&self) -> usize;

    fn path(&self) -> &Path;

    /// Number of pages in the file, including pages not yet flushed
    fn page_count(&self) -> u64;

    fn with_page<R>(&self, page_no: u64, reader: impl FnOnce(&[u8]) -> R) -> StorageResult<R>;

    fn with_page_mut<R>(&self, page_no: u64, writer: impl FnOnce(&mut [u8]) -> R) -> StorageResult<R>;

    /// Write every modified page to the file and sync it
    fn flush(&self) -> StorageResult<()>;

    /// True when some page was modified since the last flush
    fn is_dirty(&self) -> bool;

    /// Flush and release the file. Later page accesses fail with `Closed`.
    fn close(&self) -> StorageResult<()>;

    fn is_closed(&self) -> bool;
}

/// Storage backend selected at runtime
#[derive(Debug)]
pub enum AnyPagedStorage {
    PageCache(FilePagedStorage),
    Mmap(MmapPagedStorage),
}

impl PagedStorage for AnyPagedStorage {
    fn page_size(&self) -> usize {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.page_size(),
            AnyPagedStorage::Mmap(storage) => storage.page_size(),
        }
    }

    fn path(&self) -> &Path {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.path(),
            AnyPagedStorage::Mmap(storage) => storage.path(),
        }
    }

    fn page_count(&self) -> u64 {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.page_count(),
            AnyPagedStorage::Mmap(storage) => storage.page_count(),
        }
    }

    fn with_page<R>(&self, page_no: u64, reader: impl FnOnce(&[u8]) -> R) -> StorageResult<R> {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.with_page(page_no, reader),
            AnyPagedStorage::Mmap(storage) => storage.with_page(page_no, reader),
        }
    }

    fn with_page_mut<R>(&self, page_no: u64, writer: impl FnOnce(&mut [u8]) -> R) -> StorageResult<R> {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.with_page_mut(page_no, writer),
            AnyPagedStorage::Mmap(storage) => storage.with_page_mut(page_no, writer),
        }
    }

    fn flush(&self) -> StorageResult<()> {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.flush(),
            AnyPagedStorage::Mmap(storage) => storage.flush(),
        }
    }

    fn is_dirty(&self) -> bool {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.is_dirty(),
            AnyPagedStorage::Mmap(storage) => storage.is_dirty(),
        }
    }

    fn close(&self) -> StorageResult<()> {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.close(),
            AnyPagedStorage::Mmap(storage) => storage.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            AnyPagedStorage::PageCache(storage) => storage.is_closed(),
            AnyPagedStorage::Mmap(storage) => storage.is_closed(),
        }
    }
}

fn open_storage_file(path: &Path, create_if_missing: bool) -> StorageResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create_if_missing)
        .truncate(false)
        .mode(FILE_PERMISSIONS)
        .open(path)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const PAGE_SIZE: usize = 4096;

    fn backends(path: &Path, strategy: LockingStrategy) -> Vec<AnyPagedStorage> {
        let context = StorageLockContext::shared(strategy);
        vec![
            AnyPagedStorage::PageCache(
                FilePagedStorage::open(path, PAGE_SIZE, Arc::clone(&context), true).unwrap(),
            ),
            AnyPagedStorage::Mmap(MmapPagedStorage::open(path, PAGE_SIZE, context, true).unwrap()),
        ]
    }

    #[test]
    fn test_pages_start_zeroed() {
        for strategy in [LockingStrategy::PerPage, LockingStrategy::WholeStorage] {
            let temp_file = NamedTempFile::new().unwrap();
            for storage in backends(temp_file.path(), strategy) {
                let all_zero = storage
                    .with_page(3, |page| page.iter().all(|b| *b == 0))
                    .unwrap();
                assert!(all_zero);
                assert_eq!(storage.page_size(), PAGE_SIZE);
                storage.close().unwrap();
            }
        }
    }

    #[test]
    fn test_write_flush_reopen_with_other_backend() {
        let temp_file = NamedTempFile::new().unwrap();
        let context = StorageLockContext::shared(LockingStrategy::PerPage);

        let storage = FilePagedStorage::open(temp_file.path(), PAGE_SIZE, Arc::clone(&context), true).unwrap();
        storage
            .with_page_mut(2, |page| page[10..14].copy_from_slice(b"blob"))
            .unwrap();
        assert!(storage.is_dirty());
        storage.close().unwrap();

        let mapped = MmapPagedStorage::open(temp_file.path(), PAGE_SIZE, context, true).unwrap();
        assert!(mapped.page_count() >= 3);
        let bytes = mapped.with_page(2, |page| page[10..14].to_vec()).unwrap();
        assert_eq!(bytes, b"blob");
        mapped
            .with_page_mut(0, |page| page[0] = 7)
            .unwrap();
        mapped.close().unwrap();

        let reopened = FilePagedStorage::open(
            temp_file.path(),
            PAGE_SIZE,
            StorageLockContext::shared(LockingStrategy::WholeStorage),
            true,
        )
        .unwrap();
        assert_eq!(reopened.with_page(0, |page| page[0]).unwrap(), 7);
        assert_eq!(reopened.with_page(2, |page| page[10..14].to_vec()).unwrap(), b"blob");
    }

    #[test]
    fn test_access_after_close_fails() {
        let temp_file = NamedTempFile::new().unwrap();
        for storage in backends(temp_file.path(), LockingStrategy::PerPage) {
            storage.close().unwrap();
            assert!(storage.is_closed());
            assert!(matches!(
                storage.with_page(0, |_| ()),
                Err(crate::errors::StorageError::Closed)
            ));
        }
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.blobs");
        let context = StorageLockContext::shared(LockingStrategy::PerPage);

        assert!(FilePagedStorage::open(&path, PAGE_SIZE, Arc::clone(&context), false).is_err());
        assert!(MmapPagedStorage::open(&path, PAGE_SIZE, context, false).is_err());
    }
}
