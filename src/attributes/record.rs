//! Encoding of attribute records stored in the blob storage.
//!
//! Two record kinds share the storage:
//!
//! ```text
//! directory: kind=1 | file_id:u32 | entry*
//!   entry:   varint(attribute_id << 1 | is_ref) | varint(len or record id) | inline bytes
//! dedicated: kind=2 | file_id:u32 | attribute_id:u32 | value
//! ```
//!
//! One directory record per file lists all of its attributes. Small values
//! are stored inline in the directory; large ones get a dedicated record
//! whose header points back to the owning file and attribute.

use crate::errors::{StorageError, StorageResult};
use crate::storage::RecordId;

pub const DIRECTORY_RECORD_KIND: u8 = 1;
pub const DEDICATED_RECORD_KIND: u8 = 2;

pub const DIRECTORY_HEADER_SIZE: usize = 5;
pub const DEDICATED_HEADER_SIZE: usize = 9;

/// Largest attribute id; ids are encoded in 14 bits
pub const MAX_ATTRIBUTE_ID: u32 = (1 << 14) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Directory,
    Dedicated,
}

/// Kind of an attribute record, from its first byte
pub fn record_kind(bytes: &[u8]) -> Option<RecordKind> {
    match bytes.first() {
        Some(&DIRECTORY_RECORD_KIND) => Some(RecordKind::Directory),
        Some(&DEDICATED_RECORD_KIND) => Some(RecordKind::Dedicated),
        _ => None,
    }
}

/// Where an attribute value lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(Vec<u8>),
    BlobBacked(RecordId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeEntry {
    pub attribute_id: u32,
    pub value: StoredValue,
}

impl AttributeEntry {
    fn encoded_len(&self) -> usize {
        entry_encoded_len(self.attribute_id, &self.value)
    }
}

fn entry_encoded_len(attribute_id: u32, value: &StoredValue) -> usize {
    let tag = varint_len(attribute_id << 1);
    match value {
        StoredValue::Inline(bytes) => tag + varint_len(bytes.len() as u32) + bytes.len(),
        StoredValue::BlobBacked(id) => tag + varint_len(id.as_u32()),
    }
}

/// All attributes of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub file_id: u32,
    pub entries: Vec<AttributeEntry>,
}

impl DirectoryRecord {
    pub fn new(file_id: u32) -> Self {
        Self {
            file_id,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, attribute_id: u32) -> Option<&StoredValue> {
        self.entries
            .iter()
            .find(|entry| entry.attribute_id == attribute_id)
            .map(|entry| &entry.value)
    }

    /// Set the value of `attribute_id`, returning the previous one
    pub fn upsert(&mut self, attribute_id: u32, value: StoredValue) -> Option<StoredValue> {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.attribute_id == attribute_id)
        {
            Some(entry) => Some(std::mem::replace(&mut entry.value, value)),
            None => {
                self.entries.push(AttributeEntry { attribute_id, value });
                None
            }
        }
    }

    pub fn remove(&mut self, attribute_id: u32) -> Option<StoredValue> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.attribute_id == attribute_id)?;
        Some(self.entries.remove(position).value)
    }

    pub fn encoded_len(&self) -> usize {
        DIRECTORY_HEADER_SIZE
            + self
                .entries
                .iter()
                .map(AttributeEntry::encoded_len)
                .sum::<usize>()
    }

    /// Encoded length after `upsert(attribute_id, value)`
    pub fn encoded_len_with(&self, attribute_id: u32, value: &StoredValue) -> usize {
        let replaced = self
            .entries
            .iter()
            .find(|entry| entry.attribute_id == attribute_id)
            .map(AttributeEntry::encoded_len)
            .unwrap_or(0);
        self.encoded_len() - replaced + entry_encoded_len(attribute_id, value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_len());
        buffer.push(DIRECTORY_RECORD_KIND);
        buffer.extend_from_slice(&self.file_id.to_be_bytes());
        for entry in &self.entries {
            match &entry.value {
                StoredValue::Inline(bytes) => {
                    put_varint(&mut buffer, entry.attribute_id << 1);
                    put_varint(&mut buffer, bytes.len() as u32);
                    buffer.extend_from_slice(bytes);
                }
                StoredValue::BlobBacked(id) => {
                    put_varint(&mut buffer, (entry.attribute_id << 1) | 1);
                    put_varint(&mut buffer, id.as_u32());
                }
            }
        }
        buffer
    }

    /// Decode the directory stored in record `id`
    pub fn decode(id: RecordId, bytes: &[u8]) -> StorageResult<Self> {
        if record_kind(bytes) != Some(RecordKind::Directory) || bytes.len() < DIRECTORY_HEADER_SIZE {
            return Err(StorageError::corrupted(id, "not a directory record"));
        }
        let file_id = read_u32(&bytes[1..5]);

        let mut entries: Vec<AttributeEntry> = Vec::new();
        let mut pos = DIRECTORY_HEADER_SIZE;
        while pos < bytes.len() {
            let tag = get_varint(bytes, &mut pos).ok_or_else(|| StorageError::corrupted(id, "truncated entry tag"))?;
            let attribute_id = tag >> 1;
            if attribute_id > MAX_ATTRIBUTE_ID {
                return Err(StorageError::corrupted(
                    id,
                    format!("attribute id {} out of range", attribute_id),
                ));
            }
            if entries.iter().any(|entry| entry.attribute_id == attribute_id) {
                return Err(StorageError::corrupted(
                    id,
                    format!("attribute {} listed twice", attribute_id),
                ));
            }
            let operand =
                get_varint(bytes, &mut pos).ok_or_else(|| StorageError::corrupted(id, "truncated entry length"))?;

            let value = if tag & 1 == 1 {
                StoredValue::BlobBacked(RecordId(operand))
            } else {
                let end = pos + operand as usize;
                if end > bytes.len() {
                    return Err(StorageError::corrupted(
                        id,
                        format!("inline value of attribute {} is truncated", attribute_id),
                    ));
                }
                let value = bytes[pos..end].to_vec();
                pos = end;
                StoredValue::Inline(value)
            };
            entries.push(AttributeEntry { attribute_id, value });
        }

        Ok(Self { file_id, entries })
    }
}

/// Decoded dedicated record, borrowing the value bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedicatedRecord<'a> {
    pub file_id: u32,
    pub attribute_id: u32,
    pub value: &'a [u8],
}

impl<'a> DedicatedRecord<'a> {
    pub fn encoded_len(value_len: usize) -> usize {
        DEDICATED_HEADER_SIZE + value_len
    }

    pub fn encode(file_id: u32, attribute_id: u32, value: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::encoded_len(value.len()));
        buffer.push(DEDICATED_RECORD_KIND);
        buffer.extend_from_slice(&file_id.to_be_bytes());
        buffer.extend_from_slice(&attribute_id.to_be_bytes());
        buffer.extend_from_slice(value);
        buffer
    }

    pub fn decode(id: RecordId, bytes: &'a [u8]) -> StorageResult<Self> {
        if record_kind(bytes) != Some(RecordKind::Dedicated) || bytes.len() < DEDICATED_HEADER_SIZE {
            return Err(StorageError::corrupted(id, "not a dedicated attribute record"));
        }
        Ok(Self {
            file_id: read_u32(&bytes[1..5]),
            attribute_id: read_u32(&bytes[5..9]),
            value: &bytes[DEDICATED_HEADER_SIZE..],
        })
    }

    /// Check the back reference names the expected owner
    pub fn check_owner(&self, id: RecordId, file_id: u32, attribute_id: u32) -> StorageResult<()> {
        if self.file_id != file_id || self.attribute_id != attribute_id {
            return Err(StorageError::corrupted(
                id,
                format!(
                    "belongs to file {} attribute {}, referenced from file {} attribute {}",
                    self.file_id, self.attribute_id, file_id, attribute_id
                ),
            ));
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(raw)
}

fn put_varint(buffer: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buffer.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

fn get_varint(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let mut value: u32 = 0;
    for shift in (0..35).step_by(7) {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        value |= ((byte & 0x7F) as u32).checked_shl(shift)?;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths_match_encoding() {
        for value in [0, 1, 127, 128, 16383, 16384, 2_097_151, 2_097_152, u32::MAX] {
            let mut buffer = Vec::new();
            put_varint(&mut buffer, value);
            assert_eq!(buffer.len(), varint_len(value), "value {}", value);

            let mut pos = 0;
            assert_eq!(get_varint(&buffer, &mut pos), Some(value));
            assert_eq!(pos, buffer.len());
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut pos = 0;
        assert_eq!(get_varint(&[0x80, 0x80], &mut pos), None);
    }

    #[test]
    fn test_directory_encoding_layout() {
        let mut directory = DirectoryRecord::new(7);
        directory.upsert(3, StoredValue::Inline(b"ab".to_vec()));
        directory.upsert(200, StoredValue::BlobBacked(RecordId(300)));

        let encoded = directory.encode();
        assert_eq!(encoded.len(), directory.encoded_len());
        assert_eq!(
            encoded,
            vec![
                1, 0, 0, 0, 7, // kind, file id
                6, 2, b'a', b'b', // attribute 3, inline, 2 bytes
                0x91, 0x03, 0xAC, 0x02, // attribute 200, ref, record 300
            ]
        );
        assert_eq!(DirectoryRecord::decode(RecordId(1), &encoded).unwrap(), directory);
    }

    #[test]
    fn test_directory_upsert_and_remove() {
        let mut directory = DirectoryRecord::new(1);
        assert_eq!(directory.upsert(5, StoredValue::Inline(vec![1])), None);
        assert_eq!(
            directory.upsert(5, StoredValue::Inline(vec![2])),
            Some(StoredValue::Inline(vec![1]))
        );
        assert_eq!(directory.entries.len(), 1);

        let projected = directory.encoded_len_with(5, &StoredValue::Inline(vec![0; 10]));
        let mut grown = directory.clone();
        grown.upsert(5, StoredValue::Inline(vec![0; 10]));
        assert_eq!(projected, grown.encode().len());

        assert_eq!(directory.remove(5), Some(StoredValue::Inline(vec![2])));
        assert_eq!(directory.remove(5), None);
        assert!(directory.is_empty());
    }

    #[test]
    fn test_directory_rejects_garbage() {
        let id = RecordId(9);
        assert!(DirectoryRecord::decode(id, &[2, 0, 0, 0, 1]).is_err());
        assert!(DirectoryRecord::decode(id, &[1, 0, 0]).is_err());
        // inline value claims 5 bytes, 1 present
        assert!(DirectoryRecord::decode(id, &[1, 0, 0, 0, 1, 2, 5, 0]).is_err());
        // attribute 1 twice
        assert!(DirectoryRecord::decode(id, &[1, 0, 0, 0, 1, 2, 0, 2, 0]).is_err());
    }

    #[test]
    fn test_dedicated_record_back_reference() {
        let encoded = DedicatedRecord::encode(11, 22, b"payload");
        assert_eq!(encoded.len(), DedicatedRecord::encoded_len(7));
        assert_eq!(record_kind(&encoded), Some(RecordKind::Dedicated));

        let id = RecordId(40);
        let record = DedicatedRecord::decode(id, &encoded).unwrap();
        assert_eq!(record.value, b"payload");
        assert!(record.check_owner(id, 11, 22).is_ok());
        assert!(matches!(
            record.check_owner(id, 11, 23),
            Err(StorageError::CorruptedRecord { .. })
        ));
    }
}
