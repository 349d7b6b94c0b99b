//! Streamlined blob storage over paged files.
//!
//! - [`allocation`]: how much capacity a record reserves
//! - [`paged`]: page-level access to the storage file
//! - [`blob_store`]: records, relocation and space reuse

pub mod allocation;
pub mod blob_store;
pub mod constants;
pub mod header;
pub mod paged;
pub mod types;

pub use allocation::{DataLengthPlusFixedPercentStrategy, ExactFitStrategy, SpaceAllocationStrategy};
pub use blob_store::StreamlinedBlobStorage;
pub use paged::{
    AnyPagedStorage, FilePagedStorage, LockingStrategy, MmapPagedStorage, PagedStorage, StorageLockContext,
};
pub use types::{BlobStorageStats, RecordId, RecordInfo, RecordState};
