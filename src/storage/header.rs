//! Encoding of the storage file header.

use super::constants::{HEADER_SIZE, header_offset};
use super::types::FileHeader;
use crate::errors::{StorageError, StorageResult};

fn put_u32(buffer: &mut [u8], offset: u64, value: u32) {
    let start = offset as usize;
    buffer[start..start + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buffer: &mut [u8], offset: u64, value: u64) {
    let start = offset as usize;
    buffer[start..start + 8].copy_from_slice(&value.to_be_bytes());
}

fn get_u32(bytes: &[u8], offset: u64) -> u32 {
    let start = offset as usize;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[start..start + 4]);
    u32::from_be_bytes(raw)
}

fn get_u64(bytes: &[u8], offset: u64) -> u64 {
    let start = offset as usize;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[start..start + 8]);
    u64::from_be_bytes(raw)
}

/// Encode FileHeader to its on-disk bytes (big-endian)
pub fn encode_header(header: &FileHeader) -> [u8; HEADER_SIZE as usize] {
    let mut buffer = [0u8; HEADER_SIZE as usize];

    buffer[..8].copy_from_slice(&header.magic);
    put_u32(&mut buffer, header_offset::VERSION, header.version);
    put_u32(&mut buffer, header_offset::FILE_STATUS, header.file_status);
    put_u32(&mut buffer, header_offset::PAGE_SIZE, header.page_size);
    put_u32(&mut buffer, header_offset::DATA_FORMAT_VERSION, header.data_format_version);
    put_u32(&mut buffer, header_offset::RECORDS_ALLOCATED, header.records_allocated);
    put_u32(&mut buffer, header_offset::RECORDS_RELOCATED, header.records_relocated);
    put_u32(&mut buffer, header_offset::RECORDS_DELETED, header.records_deleted);
    put_u32(&mut buffer, header_offset::RESERVED, 0);
    put_u64(&mut buffer, header_offset::LIVE_PAYLOAD_BYTES, header.live_payload_bytes);
    put_u64(&mut buffer, header_offset::LIVE_CAPACITY_BYTES, header.live_capacity_bytes);
    put_u64(&mut buffer, header_offset::NEXT_RECORD_OFFSET, header.next_record_offset);
    put_u64(&mut buffer, header_offset::CHECKSUM, header.checksum);

    buffer
}

/// Decode FileHeader from its on-disk bytes
pub fn decode_header(bytes: &[u8]) -> StorageResult<FileHeader> {
    if bytes.len() < HEADER_SIZE as usize {
        return Err(StorageError::invalid_header(
            "header",
            format!("{} bytes available, {} required", bytes.len(), HEADER_SIZE),
        ));
    }

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&bytes[..8]);

    Ok(FileHeader {
        magic,
        version: get_u32(bytes, header_offset::VERSION),
        file_status: get_u32(bytes, header_offset::FILE_STATUS),
        page_size: get_u32(bytes, header_offset::PAGE_SIZE),
        data_format_version: get_u32(bytes, header_offset::DATA_FORMAT_VERSION),
        records_allocated: get_u32(bytes, header_offset::RECORDS_ALLOCATED),
        records_relocated: get_u32(bytes, header_offset::RECORDS_RELOCATED),
        records_deleted: get_u32(bytes, header_offset::RECORDS_DELETED),
        live_payload_bytes: get_u64(bytes, header_offset::LIVE_PAYLOAD_BYTES),
        live_capacity_bytes: get_u64(bytes, header_offset::LIVE_CAPACITY_BYTES),
        next_record_offset: get_u64(bytes, header_offset::NEXT_RECORD_OFFSET),
        checksum: get_u64(bytes, header_offset::CHECKSUM),
    })
}
