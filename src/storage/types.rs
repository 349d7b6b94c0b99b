//! Core type definitions for the blob storage.
//!
//! Record identifiers, the file header, per-record headers and the
//! statistics snapshot exposed to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::constants::{self, file_status, record};
use crate::errors::{StorageError, StorageResult};

/// File offset within the storage file
pub type FileOffset = u64;

/// Identifier of a record in the blob storage.
///
/// A record id is the record's file offset divided by
/// [`OFFSET_BUCKET`](super::constants::OFFSET_BUCKET). Id 0 points into the
/// file header, so it never names a record and is used as NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u32);

impl RecordId {
    pub const NULL: RecordId = RecordId(0);

    /// Largest file offset a record id can address
    pub const MAX_OFFSET: FileOffset = u32::MAX as u64 * constants::OFFSET_BUCKET;

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn offset(self) -> FileOffset {
        self.0 as u64 * constants::OFFSET_BUCKET
    }

    /// Convert a bucket-aligned offset into a record id.
    pub fn from_offset(offset: FileOffset) -> StorageResult<Self> {
        debug_assert_eq!(offset % constants::OFFSET_BUCKET, 0);
        if offset > Self::MAX_OFFSET {
            return Err(StorageError::StorageFull {
                offset,
                max_offset: Self::MAX_OFFSET,
            });
        }
        Ok(RecordId((offset / constants::OFFSET_BUCKET) as u32))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File header of a blob storage file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Magic number ("VFSBLOB\0")
    pub magic: [u8; 8],
    /// Storage format version
    pub version: u32,
    /// OPENED or SAFELY_CLOSED
    pub file_status: u32,
    /// Page size the file was created with
    pub page_size: u32,
    /// Version of the client's data format, opaque to the storage
    pub data_format_version: u32,
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    /// Sum of payload lengths of live records
    pub live_payload_bytes: u64,
    /// Sum of capacities of live records
    pub live_capacity_bytes: u64,
    /// Offset where the next appended record goes
    pub next_record_offset: FileOffset,
    pub checksum: u64,
}

impl FileHeader {
    /// Create a header for a freshly created storage
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: constants::MAGIC_BYTES,
            version: constants::STORAGE_VERSION,
            file_status: file_status::OPENED,
            page_size,
            data_format_version: 0,
            records_allocated: 0,
            records_relocated: 0,
            records_deleted: 0,
            live_payload_bytes: 0,
            live_capacity_bytes: 0,
            next_record_offset: constants::HEADER_SIZE,
            checksum: 0,
        }
    }

    /// Validate the header against the page size the storage is opened with
    pub fn validate(&self, expected_page_size: usize) -> StorageResult<()> {
        if self.magic != constants::MAGIC_BYTES {
            return Err(StorageError::InvalidMagic {
                expected: u64::from_be_bytes(constants::MAGIC_BYTES),
                found: u64::from_be_bytes(self.magic),
            });
        }

        if self.version != constants::STORAGE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                version: self.version,
                supported: constants::STORAGE_VERSION,
            });
        }

        if self.page_size as usize != expected_page_size {
            return Err(StorageError::invalid_header(
                "page_size",
                format!(
                    "file was created with {} byte pages, opened with {}",
                    self.page_size, expected_page_size
                ),
            ));
        }

        if self.next_record_offset < constants::HEADER_SIZE
            || self.next_record_offset % constants::OFFSET_BUCKET != 0
        {
            return Err(StorageError::invalid_header(
                "next_record_offset",
                format!("{} is not a valid record offset", self.next_record_offset),
            ));
        }

        let accounted = self.records_relocated as u64 + self.records_deleted as u64;
        if accounted > self.records_allocated as u64 {
            return Err(StorageError::invalid_header(
                "records_allocated",
                "fewer records allocated than relocated + deleted",
            ));
        }

        Ok(())
    }

    /// Records currently live: allocated - relocated - deleted
    pub fn live_records(&self) -> u32 {
        self.records_allocated
            .saturating_sub(self.records_relocated)
            .saturating_sub(self.records_deleted)
    }

    pub fn compute_checksum(&self) -> u64 {
        let mut checksum = constants::checksum::XOR_SEED;

        checksum ^= u64::from_be_bytes(self.magic);
        checksum ^= self.version as u64;
        checksum ^= (self.file_status as u64) << 32;
        checksum ^= self.page_size as u64;
        checksum ^= (self.data_format_version as u64) << 32;
        checksum ^= self.records_allocated as u64;
        checksum ^= (self.records_relocated as u64) << 16;
        checksum ^= (self.records_deleted as u64) << 32;
        checksum ^= self.live_payload_bytes.rotate_left(8);
        checksum ^= self.live_capacity_bytes.rotate_left(24);
        checksum ^= self.next_record_offset.rotate_left(40);

        checksum
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn verify_checksum(&self) -> StorageResult<()> {
        let expected = self.compute_checksum();
        if self.checksum != expected {
            return Err(StorageError::InvalidChecksum {
                expected,
                found: self.checksum,
            });
        }
        Ok(())
    }
}

/// State of a record, derived from its length field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Live,
    /// Filler at the end of a page
    Padding,
    /// Relocated, `redirect_to` names the new location
    Moved,
    /// Deleted, its space may be reused
    Deleted,
}

/// 8-byte header in front of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub capacity: u16,
    /// Payload length, or one of the state marks
    pub length: u16,
    pub redirect_to: RecordId,
}

impl RecordHeader {
    pub fn live(capacity: u16, length: u16) -> Self {
        Self {
            capacity,
            length,
            redirect_to: RecordId::NULL,
        }
    }

    pub fn padding(capacity: u16) -> Self {
        Self {
            capacity,
            length: record::PADDING_MARK,
            redirect_to: RecordId::NULL,
        }
    }

    pub fn moved(capacity: u16, redirect_to: RecordId) -> Self {
        Self {
            capacity,
            length: record::MOVED_MARK,
            redirect_to,
        }
    }

    pub fn deleted(capacity: u16) -> Self {
        Self {
            capacity,
            length: record::DELETED_MARK,
            redirect_to: RecordId::NULL,
        }
    }

    pub fn state(&self) -> RecordState {
        match self.length {
            record::PADDING_MARK => RecordState::Padding,
            record::MOVED_MARK => RecordState::Moved,
            record::DELETED_MARK => RecordState::Deleted,
            _ => RecordState::Live,
        }
    }

    /// Payload length of a live record, 0 otherwise
    pub fn payload_len(&self) -> usize {
        match self.state() {
            RecordState::Live => self.length as usize,
            _ => 0,
        }
    }

    /// Bytes the record occupies in its page, header included
    pub fn footprint(&self) -> usize {
        record::HEADER_SIZE + self.capacity as usize
    }

    pub fn read_from(bytes: &[u8]) -> Self {
        let capacity = u16::from_be_bytes([
            bytes[record::CAPACITY_OFFSET],
            bytes[record::CAPACITY_OFFSET + 1],
        ]);
        let length = u16::from_be_bytes([bytes[record::LENGTH_OFFSET], bytes[record::LENGTH_OFFSET + 1]]);
        let mut redirect = [0u8; 4];
        redirect.copy_from_slice(&bytes[record::REDIRECT_OFFSET..record::REDIRECT_OFFSET + 4]);
        Self {
            capacity,
            length,
            redirect_to: RecordId(u32::from_be_bytes(redirect)),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[record::CAPACITY_OFFSET..record::CAPACITY_OFFSET + 2]
            .copy_from_slice(&self.capacity.to_be_bytes());
        bytes[record::LENGTH_OFFSET..record::LENGTH_OFFSET + 2].copy_from_slice(&self.length.to_be_bytes());
        bytes[record::REDIRECT_OFFSET..record::REDIRECT_OFFSET + 4]
            .copy_from_slice(&self.redirect_to.as_u32().to_be_bytes());
    }

    /// Check the header is plausible for a record starting at `offset_in_page`
    pub fn check_bounds(&self, id: RecordId, offset_in_page: usize, page_size: usize) -> StorageResult<()> {
        if offset_in_page + self.footprint() > page_size {
            return Err(StorageError::corrupted(
                id,
                format!(
                    "capacity {} at page offset {} crosses the page boundary",
                    self.capacity, offset_in_page
                ),
            ));
        }
        if self.state() == RecordState::Live && self.length > self.capacity {
            return Err(StorageError::corrupted(
                id,
                format!("length {} exceeds capacity {}", self.length, self.capacity),
            ));
        }
        Ok(())
    }
}

/// What a record scan reports for every record it visits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: RecordId,
    pub state: RecordState,
    pub capacity: u16,
    /// Payload length; 0 for non-live records
    pub length: usize,
    /// Redirect target of MOVED records, NULL otherwise
    pub redirect_to: RecordId,
}

/// Snapshot of the storage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStorageStats {
    pub page_size: u32,
    pub data_format_version: u32,
    pub records_allocated: u32,
    pub records_relocated: u32,
    pub records_deleted: u32,
    pub live_records: u32,
    pub live_payload_bytes: u64,
    pub live_capacity_bytes: u64,
    /// Deleted records waiting to be reused
    pub reclaimable_records: usize,
    /// Bytes of the file addressed by records, header included
    pub size_in_bytes: u64,
}

impl BlobStorageStats {
    /// Share of reserved capacity actually holding payload, in [0, 1]
    pub fn payload_utilization(&self) -> f64 {
        if self.live_capacity_bytes == 0 {
            return 1.0;
        }
        self.live_payload_bytes as f64 / self.live_capacity_bytes as f64
    }
}
