//! File attributes stored in a streamlined blob storage.
//!
//! Maps `(file_id, attribute_id)` keys to byte values. See
//! [`AttributesStorage`] for the storage layout and [`record`] for the
//! encoding of the records it writes.

pub mod record;
mod storage;

pub use record::{MAX_ATTRIBUTE_ID, StoredValue};
pub use storage::{AttributeHandle, AttributeVisit, AttributesStats, AttributesStorage, SanityReport, ValueLocation};
