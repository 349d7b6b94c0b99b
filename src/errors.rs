use thiserror::Error;

use crate::storage::types::RecordId;

/// Error type for blob and attribute storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record too large: {size} bytes (maximum {max_size} bytes)")]
    CapacityExceeded { size: usize, max_size: usize },

    #[error("Storage is full: {offset} bytes addressed (maximum {max_offset} bytes)")]
    StorageFull { offset: u64, max_offset: u64 },

    #[error("Record {id} not found")]
    RecordNotFound { id: RecordId },

    #[error("Record {id} is already deleted")]
    RecordAlreadyDeleted { id: RecordId },

    #[error("Attribute {attribute_id} of file {file_id} not found")]
    AttributeNotFound { file_id: u32, attribute_id: u32 },

    #[error("Attribute ID {attribute_id} out of bounds (valid range: 0-{max_id})")]
    InvalidAttributeId { attribute_id: u32, max_id: u32 },

    #[error("Invalid magic number: expected {expected:016x}, found {found:016x}")]
    InvalidMagic { expected: u64, found: u64 },

    #[error("Unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion { version: u32, supported: u32 },

    #[error("Invalid header field '{field}': {reason}")]
    InvalidHeader { field: String, reason: String },

    #[error("Invalid header checksum: expected {expected:016x}, found {found:016x}")]
    InvalidChecksum { expected: u64, found: u64 },

    #[error("Storage was not closed properly (file status {status})")]
    NotClosedProperly { status: u32 },

    #[error("Corrupt record {id}: {reason}")]
    CorruptedRecord { id: RecordId, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage is closed")]
    Closed,
}

impl StorageError {
    pub fn invalid_config<T: Into<String>>(msg: T) -> Self {
        StorageError::InvalidConfig(msg.into())
    }

    pub fn corrupted<T: Into<String>>(id: RecordId, reason: T) -> Self {
        StorageError::CorruptedRecord {
            id,
            reason: reason.into(),
        }
    }

    pub fn invalid_header<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        StorageError::InvalidHeader {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for every "the thing you asked for is not there" condition, as
    /// opposed to I/O or corruption failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RecordNotFound { .. }
                | StorageError::RecordAlreadyDeleted { .. }
                | StorageError::AttributeNotFound { .. }
        )
    }

    /// True for failures raised while opening a storage file.
    pub fn is_initialization_failure(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidMagic { .. }
                | StorageError::UnsupportedVersion { .. }
                | StorageError::InvalidHeader { .. }
                | StorageError::InvalidChecksum { .. }
                | StorageError::NotClosedProperly { .. }
        )
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
