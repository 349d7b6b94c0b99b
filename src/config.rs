//! Configuration for backend selection and storage options.
//!
//! This module provides the configuration structures for opening a blob
//! storage or an attributes storage: which paged backend to use, how page
//! accesses are locked, how much slack records reserve and where attribute
//! values are stored. Configurations are plain serde structs and can be
//! loaded from JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::attributes::AttributesStorage;
use crate::errors::{StorageError, StorageResult};
use crate::storage::constants::{self, max_record_capacity};
use crate::storage::{
    AnyPagedStorage, DataLengthPlusFixedPercentStrategy, FilePagedStorage, LockingStrategy, MmapPagedStorage,
    StorageLockContext, StreamlinedBlobStorage,
};

/// Paged backend selection.
///
/// Both backends read and write the same file format, so a file written with
/// one can be opened with the other.
///
/// # Examples
///
/// ```rust
/// use vfsattrs::{BackendKind, StorageConfig};
///
/// let cfg = StorageConfig::default();
/// assert_eq!(cfg.backend, BackendKind::PageCache);
///
/// let cfg = StorageConfig::mmap();
/// assert_eq!(cfg.backend, BackendKind::Mmap);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Pages cached in memory, read and written with positional file I/O
    ///
    /// **Use when you need:**
    /// - Predictable memory usage tied to the pages actually touched
    /// - Explicit control over when data reaches the file
    #[default]
    PageCache,

    /// The whole file mapped into memory with `memmap2`
    ///
    /// **Use when you need:**
    /// - Fast random reads over large files
    /// - Letting the OS page cache do the caching
    Mmap,
}

impl BackendKind {
    pub fn parse(value: &str) -> StorageResult<Self> {
        match value {
            "page-cache" | "page_cache" | "pagecache" => Ok(BackendKind::PageCache),
            "mmap" => Ok(BackendKind::Mmap),
            other => Err(StorageError::invalid_config(format!(
                "unknown backend '{}' (expected page-cache or mmap)",
                other
            ))),
        }
    }
}

/// Parameters of the [`DataLengthPlusFixedPercentStrategy`].
///
/// A record for a payload of `len` bytes reserves
/// `max(min_capacity, len + fixed_bonus, ceil(len * (1 + percent_on_top / 100)))`
/// bytes, capped at `max_capacity`.
///
/// # Default Configuration
///
/// ```rust
/// use vfsattrs::AllocationConfig;
///
/// let config = AllocationConfig::default();
/// assert_eq!(config.min_capacity, 64);
/// assert_eq!(config.percent_on_top, 30);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Smallest capacity any record gets
    ///
    /// **Default:** `64`
    pub min_capacity: u32,

    /// Bytes added on top of the payload length
    ///
    /// **Default:** `0`
    pub fixed_bonus: u32,

    /// Percent of the payload length added on top of it
    ///
    /// **Default:** `30`
    pub percent_on_top: u32,

    /// Largest record capacity, and so the largest payload
    ///
    /// **Default:** `None`, meaning the largest capacity the page size allows
    ///
    /// Must fit into a page together with the 8-byte record header.
    pub max_capacity: Option<u32>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            min_capacity: 64,
            fixed_bonus: 0,
            percent_on_top: 30,
            max_capacity: None,
        }
    }
}

impl AllocationConfig {
    /// Effective max capacity for the given page size
    pub fn max_capacity_for(&self, page_size: usize) -> u32 {
        self.max_capacity
            .unwrap_or_else(|| max_record_capacity(page_size))
    }

    pub fn build_strategy(&self, page_size: usize) -> StorageResult<DataLengthPlusFixedPercentStrategy> {
        DataLengthPlusFixedPercentStrategy::new(
            self.min_capacity,
            self.fixed_bonus,
            self.percent_on_top,
            self.max_capacity_for(page_size),
        )
    }
}

/// Options of the attributes layer.
///
/// # Default Configuration
///
/// ```rust
/// use vfsattrs::AttributesConfig;
///
/// let config = AttributesConfig::default();
/// assert_eq!(config.inline_attribute_smaller_than, 64);
/// assert!(config.ignore_already_deleted_errors);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributesConfig {
    /// Values shorter than this are stored inline in the file's directory
    /// record; longer values get a dedicated record.
    ///
    /// **Default:** `64`
    pub inline_attribute_smaller_than: usize,

    /// Treat "record already deleted" while removing a dedicated value record
    /// as success (logged as a warning) instead of failing the operation.
    ///
    /// **Default:** `true`
    ///
    /// Lets a storage with a stale reference heal itself: the reference is
    /// dropped from the directory and the operation completes.
    pub ignore_already_deleted_errors: bool,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            inline_attribute_smaller_than: 64,
            ignore_already_deleted_errors: true,
        }
    }
}

/// Complete configuration for opening a storage.
///
/// # Default Configuration
///
/// ```rust
/// use vfsattrs::{BackendKind, LockingStrategy, StorageConfig};
///
/// let config = StorageConfig::default();
/// assert_eq!(config.backend, BackendKind::PageCache);
/// assert_eq!(config.locking, LockingStrategy::PerPage);
/// assert_eq!(config.page_size, 64 * 1024);
/// assert!(config.create_if_missing);
/// assert!(config.validate().is_ok());
/// ```
///
/// # Examples
///
/// ```rust
/// use vfsattrs::{LockingStrategy, StorageConfig};
///
/// let config: StorageConfig = serde_json::from_str(
///     r#"{ "backend": "mmap", "locking": "whole-storage", "page_size": 8192 }"#,
/// )?;
/// assert_eq!(config.page_size, 8192);
/// assert_eq!(config.locking, LockingStrategy::WholeStorage);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which paged backend to use
    ///
    /// **Default:** [`BackendKind::PageCache`]
    pub backend: BackendKind,

    /// How page accesses are locked
    ///
    /// **Default:** [`LockingStrategy::PerPage`]
    pub locking: LockingStrategy,

    /// Page size in bytes: a power of two between 4 KiB and 64 KiB
    ///
    /// **Default:** `65536`
    ///
    /// Fixed when the file is created; opening a file with a different page
    /// size fails.
    pub page_size: usize,

    /// Record capacity reservation
    pub allocation: AllocationConfig,

    /// Attribute layer options
    pub attributes: AttributesConfig,

    /// Whether to create the storage file if it doesn't exist
    ///
    /// **Default:** `true`
    pub create_if_missing: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            locking: LockingStrategy::default(),
            page_size: constants::DEFAULT_PAGE_SIZE,
            allocation: AllocationConfig::default(),
            attributes: AttributesConfig::default(),
            create_if_missing: true,
        }
    }
}

impl StorageConfig {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn page_cache() -> Self {
        Self::new(BackendKind::PageCache)
    }

    pub fn mmap() -> Self {
        Self::new(BackendKind::Mmap)
    }

    pub fn with_locking(mut self, locking: LockingStrategy) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Load a configuration from a JSON file. Missing fields take their
    /// default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: StorageConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is consistent before any file is touched
    pub fn validate(&self) -> StorageResult<()> {
        if !self.page_size.is_power_of_two()
            || !(constants::MIN_PAGE_SIZE..=constants::MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(StorageError::invalid_config(format!(
                "page_size {} must be a power of two in {}..={}",
                self.page_size,
                constants::MIN_PAGE_SIZE,
                constants::MAX_PAGE_SIZE
            )));
        }

        let limit = max_record_capacity(self.page_size);
        let max_capacity = self.allocation.max_capacity_for(self.page_size);
        if max_capacity > limit {
            return Err(StorageError::invalid_config(format!(
                "allocation.max_capacity {} doesn't fit into {} byte pages (limit {})",
                max_capacity, self.page_size, limit
            )));
        }
        self.allocation.build_strategy(self.page_size)?;

        if self.attributes.inline_attribute_smaller_than > max_capacity as usize {
            return Err(StorageError::invalid_config(format!(
                "attributes.inline_attribute_smaller_than {} exceeds the record capacity {}",
                self.attributes.inline_attribute_smaller_than, max_capacity
            )));
        }

        Ok(())
    }
}

/// Open the paged backend selected by `config`.
pub fn open_paged_storage<P: AsRef<Path>>(
    path: P,
    config: &StorageConfig,
    lock_context: Arc<StorageLockContext>,
) -> StorageResult<AnyPagedStorage> {
    config.validate()?;
    let path = path.as_ref();
    let paged = match config.backend {
        BackendKind::PageCache => AnyPagedStorage::PageCache(FilePagedStorage::open(
            path,
            config.page_size,
            lock_context,
            config.create_if_missing,
        )?),
        BackendKind::Mmap => AnyPagedStorage::Mmap(MmapPagedStorage::open(
            path,
            config.page_size,
            lock_context,
            config.create_if_missing,
        )?),
    };
    debug!(path = %path.display(), backend = ?config.backend, locking = ?config.locking, "opened paged storage");
    Ok(paged)
}

/// Open a blob storage as described by `config`.
///
/// # Examples
///
/// ```rust,no_run
/// use vfsattrs::{StorageConfig, open_blob_storage};
///
/// let storage = open_blob_storage("records.blobs", &StorageConfig::default())?;
/// let id = storage.insert(b"payload")?;
/// storage.close()?;
/// # Ok::<(), vfsattrs::StorageError>(())
/// ```
pub fn open_blob_storage<P: AsRef<Path>>(
    path: P,
    config: &StorageConfig,
) -> StorageResult<StreamlinedBlobStorage<AnyPagedStorage>> {
    let lock_context = StorageLockContext::shared(config.locking);
    let paged = open_paged_storage(path, config, lock_context)?;
    let strategy = config.allocation.build_strategy(config.page_size)?;
    StreamlinedBlobStorage::open(paged, Box::new(strategy))
}

/// Open an attributes storage as described by `config`.
///
/// # Examples
///
/// ```rust,no_run
/// use vfsattrs::{StorageConfig, open_attributes_storage};
///
/// let attributes = open_attributes_storage("attributes.blobs", &StorageConfig::default())?;
/// attributes.insert_or_update_record(1, 7, b"value")?;
/// assert_eq!(attributes.read_value_from_storage(1, 7)?, b"value");
/// attributes.close()?;
/// # Ok::<(), vfsattrs::StorageError>(())
/// ```
pub fn open_attributes_storage<P: AsRef<Path>>(
    path: P,
    config: &StorageConfig,
) -> StorageResult<AttributesStorage<AnyPagedStorage>> {
    let storage = open_blob_storage(path, config)?;
    AttributesStorage::open(storage, &config.attributes)
}
