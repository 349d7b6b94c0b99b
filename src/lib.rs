//! Persistent file attributes over a streamlined blob storage.
//!
//! vfsattrs stores small binary attributes keyed by `(file_id, attribute_id)`
//! in a single page-structured file. Values are packed into variable-size
//! records that reserve some slack, so most updates are written in place.
//!
//! # Layers
//!
//! - **Allocation strategy**: how much capacity a record reserves for a
//!   payload ([`DataLengthPlusFixedPercentStrategy`])
//! - **Blob storage**: records over fixed-size pages, with in-place updates,
//!   relocation, deletion and reuse of deleted space
//!   ([`StreamlinedBlobStorage`])
//! - **Attributes storage**: a per-file directory record holding small values
//!   inline and referencing dedicated records for large ones
//!   ([`AttributesStorage`])
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use vfsattrs::{StorageConfig, open_attributes_storage};
//!
//! let attributes = open_attributes_storage("attributes.blobs", &StorageConfig::default())?;
//!
//! attributes.insert_or_update_record(42, 1, b"content hash")?;
//! assert!(attributes.exists_in_storage(42, 1)?);
//! assert_eq!(attributes.read_value_from_storage(42, 1)?, b"content hash");
//!
//! attributes.delete_record(42, 1)?;
//! attributes.close()?;
//! # Ok::<(), vfsattrs::StorageError>(())
//! ```
//!
//! # Backend Selection
//!
//! ## Page cache (default)
//! - Pages read and written with positional file I/O
//! - Data reaches the file on `force()`/`close()`
//!
//! ## Mmap
//! - Whole file mapped with `memmap2`, grown by remapping
//! - Reads straight from the mapping
//!
//! Both backends share the file format; the [`LockingStrategy`] chooses
//! between one storage-wide lock and per-page locks.

pub mod attributes;
pub mod cli;
pub mod config;
pub mod errors;
pub mod storage;

// Re-export configuration and factories
pub use config::{
    AllocationConfig, AttributesConfig, BackendKind, StorageConfig, open_attributes_storage, open_blob_storage,
    open_paged_storage,
};

// Re-export error types
pub use errors::{StorageError, StorageResult};

// Re-export storage layers
pub use attributes::{
    AttributeHandle, AttributeVisit, AttributesStats, AttributesStorage, MAX_ATTRIBUTE_ID, SanityReport,
    StoredValue, ValueLocation,
};
pub use storage::{
    AnyPagedStorage, BlobStorageStats, DataLengthPlusFixedPercentStrategy, ExactFitStrategy, FilePagedStorage,
    LockingStrategy, MmapPagedStorage, PagedStorage, RecordId, RecordInfo, RecordState, SpaceAllocationStrategy,
    StorageLockContext, StreamlinedBlobStorage,
};
