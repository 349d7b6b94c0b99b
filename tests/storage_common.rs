#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vfsattrs::{BackendKind, LockingStrategy, StorageConfig};

pub const TEST_PAGE_SIZE: usize = 8192;

/// Every backend with every locking strategy
pub fn storage_configs() -> Vec<StorageConfig> {
    let mut configs = Vec::new();
    for backend in [BackendKind::PageCache, BackendKind::Mmap] {
        for locking in [LockingStrategy::PerPage, LockingStrategy::WholeStorage] {
            configs.push(
                StorageConfig::new(backend)
                    .with_locking(locking)
                    .with_page_size(TEST_PAGE_SIZE),
            );
        }
    }
    configs
}

pub fn storage_path(dir: &TempDir, config: &StorageConfig) -> PathBuf {
    dir.path()
        .join(format!("{:?}-{:?}.blobs", config.backend, config.locking))
}

pub fn patch_file(path: &Path, offset: u64, bytes: &[u8]) {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(bytes, offset).unwrap();
    file.sync_all().unwrap();
}
