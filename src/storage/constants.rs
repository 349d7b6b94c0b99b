//! Constants for the blob storage file format.
//!
//! Magic number, version, header field offsets and record layout of the
//! streamlined blob storage file.

/// Magic number for blob storage files
pub const MAGIC_BYTES: [u8; 8] = [b'V', b'F', b'S', b'B', b'L', b'O', b'B', 0];

/// Current file format version
pub const STORAGE_VERSION: u32 = 1;

/// File header size in bytes; records start right after it
pub const HEADER_SIZE: u64 = 72;

/// Header field offsets
pub mod header_offset {
    pub const MAGIC: u64 = 0;
    pub const VERSION: u64 = 8;
    pub const FILE_STATUS: u64 = 12;
    pub const PAGE_SIZE: u64 = 16;
    pub const DATA_FORMAT_VERSION: u64 = 20;
    pub const RECORDS_ALLOCATED: u64 = 24;
    pub const RECORDS_RELOCATED: u64 = 28;
    pub const RECORDS_DELETED: u64 = 32;
    pub const RESERVED: u64 = 36;
    pub const LIVE_PAYLOAD_BYTES: u64 = 40;
    pub const LIVE_CAPACITY_BYTES: u64 = 48;
    pub const NEXT_RECORD_OFFSET: u64 = 56;
    pub const CHECKSUM: u64 = 64;
}

/// Values of the file status header field
pub mod file_status {
    pub const OPENED: u32 = 0;
    pub const SAFELY_CLOSED: u32 = 1;
}

/// Record layout: `capacity:u16, length:u16, redirect_to:u32, payload[capacity]`
pub mod record {
    pub const CAPACITY_OFFSET: usize = 0;
    pub const LENGTH_OFFSET: usize = 2;
    pub const REDIRECT_OFFSET: usize = 4;
    pub const HEADER_SIZE: usize = 8;

    /// Largest capacity a record may have (bucket aligned, fits in u16)
    pub const MAX_CAPACITY: u32 = 0xFFF8;
    /// Largest payload a record may hold
    pub const MAX_LENGTH: u32 = MAX_CAPACITY;

    /// Length marks: values above MAX_LENGTH encode the record state
    pub const PADDING_MARK: u16 = 0xFFFF;
    pub const MOVED_MARK: u16 = 0xFFFE;
    pub const DELETED_MARK: u16 = 0xFFFD;
}

/// Record offsets are multiples of this; record id = offset / OFFSET_BUCKET
pub const OFFSET_BUCKET: u64 = 8;

/// Longest MOVED chain followed before the record is declared corrupt
pub const MAX_REDIRECT_HOPS: usize = 64;

/// Page size limits. Padding records store their capacity in a u16, so pages
/// can't be larger than 64 KiB.
pub const MIN_PAGE_SIZE: usize = 4 * 1024;
pub const MAX_PAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Checksum calculation parameters
pub mod checksum {
    pub const XOR_SEED: u64 = 0x5A5A_5A5A_5A5A_5A5A;
}

/// File permissions for new storage files
pub const FILE_PERMISSIONS: u32 = 0o644;

/// Largest record capacity usable with the given page size
pub const fn max_record_capacity(page_size: usize) -> u32 {
    let fits_page = (page_size - record::HEADER_SIZE) as u32;
    if fits_page < record::MAX_CAPACITY {
        fits_page
    } else {
        record::MAX_CAPACITY
    }
}
