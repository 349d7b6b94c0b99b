//! Attribute storage over the blob storage.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs;
use tracing::{debug, info, warn};

use super::record::{DedicatedRecord, DirectoryRecord, MAX_ATTRIBUTE_ID, RecordKind, StoredValue, record_kind};
use crate::config::AttributesConfig;
use crate::errors::{StorageError, StorageResult};
use crate::storage::{BlobStorageStats, PagedStorage, RecordId, RecordState, StreamlinedBlobStorage};

/// Where an attribute value ended up after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLocation {
    /// Stored in the file's directory record
    Inline { len: usize },
    /// Stored in its own dedicated record
    BlobBacked(RecordId),
}

/// Result of [`AttributesStorage::insert_or_update_record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeHandle {
    pub file_id: u32,
    pub attribute_id: u32,
    /// Directory record holding the file's attributes
    pub directory_record: RecordId,
    pub location: ValueLocation,
}

/// One attribute reported by [`AttributesStorage::for_each_attribute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeVisit {
    /// Directory record for inline values, dedicated record otherwise
    pub record_id: RecordId,
    pub file_id: u32,
    pub attribute_id: u32,
    pub value: Vec<u8>,
    pub inlined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttributesStats {
    /// Files with at least one attribute
    pub files: usize,
    pub blob: BlobStorageStats,
}

/// What [`AttributesStorage::check_sanity`] looked at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanityReport {
    pub directories: usize,
    pub inline_attributes: usize,
    pub dedicated_attributes: usize,
}

/// Persistent `(file_id, attribute_id) -> bytes` map.
///
/// Each file with attributes owns one directory record listing its
/// attributes; values shorter than the inline threshold live in the
/// directory, larger ones in dedicated records referenced from it. The
/// `file_id -> directory` index is kept in memory and rebuilt at open.
///
/// All operations go through one read/write lock: mutations are serialized
/// and reads share the lock, so operations on the same key are linearizable.
pub struct AttributesStorage<P: PagedStorage> {
    storage: StreamlinedBlobStorage<P>,
    inline_attribute_smaller_than: usize,
    ignore_already_deleted_errors: bool,
    directories: RwLock<AHashMap<u32, RecordId>>,
}

fn check_attribute_id(attribute_id: u32) -> StorageResult<()> {
    if attribute_id > MAX_ATTRIBUTE_ID {
        return Err(StorageError::InvalidAttributeId {
            attribute_id,
            max_id: MAX_ATTRIBUTE_ID,
        });
    }
    Ok(())
}

impl<P: PagedStorage> AttributesStorage<P> {
    /// Wrap `storage`, indexing the directory records it already holds.
    pub fn open(storage: StreamlinedBlobStorage<P>, config: &AttributesConfig) -> StorageResult<Self> {
        let mut directories = AHashMap::new();
        let mut duplicate = None;
        storage.for_each(|info, payload| {
            if info.state != RecordState::Live || record_kind(payload) != Some(RecordKind::Directory) {
                return true;
            }
            match DirectoryRecord::decode(info.id, payload) {
                Ok(directory) => {
                    if let Some(previous) = directories.insert(directory.file_id, info.id) {
                        duplicate = Some(StorageError::corrupted(
                            info.id,
                            format!(
                                "second directory record for file {} (first: {})",
                                directory.file_id, previous
                            ),
                        ));
                        return false;
                    }
                    true
                }
                Err(e) => {
                    duplicate = Some(e);
                    false
                }
            }
        })?;
        if let Some(e) = duplicate {
            return Err(e);
        }

        info!(files = directories.len(), "opened attributes storage");

        Ok(Self {
            storage,
            inline_attribute_smaller_than: config.inline_attribute_smaller_than,
            ignore_already_deleted_errors: config.ignore_already_deleted_errors,
            directories: RwLock::new(directories),
        })
    }

    pub fn blob_storage(&self) -> &StreamlinedBlobStorage<P> {
        &self.storage
    }

    fn read_directory(&self, id: RecordId, file_id: u32) -> StorageResult<DirectoryRecord> {
        let directory = self
            .storage
            .read_record_with(id, |bytes| DirectoryRecord::decode(id, bytes))??;
        if directory.file_id != file_id {
            return Err(StorageError::corrupted(
                id,
                format!(
                    "directory belongs to file {}, indexed for file {}",
                    directory.file_id, file_id
                ),
            ));
        }
        Ok(directory)
    }

    fn read_dedicated(&self, id: RecordId, file_id: u32, attribute_id: u32) -> StorageResult<Vec<u8>> {
        self.storage.read_record_with(id, |bytes| -> StorageResult<Vec<u8>> {
            let record = DedicatedRecord::decode(id, bytes)?;
            record.check_owner(id, file_id, attribute_id)?;
            Ok(record.value.to_vec())
        })?
    }

    fn delete_dedicated(&self, id: RecordId) -> StorageResult<()> {
        match self.storage.delete_record(id) {
            Err(StorageError::RecordAlreadyDeleted { id }) if self.ignore_already_deleted_errors => {
                warn!(%id, "dedicated attribute record already deleted, ignoring");
                Ok(())
            }
            other => other,
        }
    }

    /// Store `value` as attribute `attribute_id` of `file_id`, replacing any
    /// previous value.
    ///
    /// Fails with [`StorageError::CapacityExceeded`] before anything is
    /// written when the value (or the grown directory) can't fit into a
    /// record.
    pub fn insert_or_update_record(
        &self,
        file_id: u32,
        attribute_id: u32,
        value: &[u8],
    ) -> StorageResult<AttributeHandle> {
        check_attribute_id(attribute_id)?;
        let mut directories = self.directories.write();

        let directory_id = directories.get(&file_id).copied();
        let mut directory = match directory_id {
            Some(id) => self.read_directory(id, file_id)?,
            None => DirectoryRecord::new(file_id),
        };
        let previous = directory.find(attribute_id).cloned();
        let inline = value.len() < self.inline_attribute_smaller_than;

        let max_size = self.storage.max_payload_size();
        let candidate = if inline {
            StoredValue::Inline(value.to_vec())
        } else {
            let size = DedicatedRecord::encoded_len(value.len());
            if size > max_size {
                return Err(StorageError::CapacityExceeded { size, max_size });
            }
            // Widest reference encoding
            StoredValue::BlobBacked(RecordId(u32::MAX))
        };
        let directory_size = directory.encoded_len_with(attribute_id, &candidate);
        if directory_size > max_size {
            return Err(StorageError::CapacityExceeded {
                size: directory_size,
                max_size,
            });
        }

        let (stored, location) = if inline {
            (candidate, ValueLocation::Inline { len: value.len() })
        } else {
            let payload = DedicatedRecord::encode(file_id, attribute_id, value);
            // A value that outgrows its record goes to a new one, so the
            // old record stays valid until the directory stops naming it
            let record_id = match previous {
                Some(StoredValue::BlobBacked(id)) if payload.len() <= self.storage.record_capacity(id)? => {
                    self.storage.update_record(id, &payload)?
                }
                _ => self.storage.insert(&payload)?,
            };
            (StoredValue::BlobBacked(record_id), ValueLocation::BlobBacked(record_id))
        };
        let previous_record = match previous {
            Some(StoredValue::BlobBacked(id)) => Some(id),
            _ => None,
        };
        let fresh_record = match location {
            ValueLocation::BlobBacked(id) if previous_record != Some(id) => Some(id),
            _ => None,
        };
        let stale = previous_record.filter(|&id| location != ValueLocation::BlobBacked(id));

        directory.upsert(attribute_id, stored);
        let encoded = directory.encode();
        let written = match directory_id {
            Some(id) => self.storage.update_record(id, &encoded),
            None => self.storage.insert(&encoded),
        };
        let directory_record = match written {
            Ok(id) => id,
            Err(e) => {
                if let Some(orphan) = fresh_record {
                    if let Err(cleanup) = self.storage.delete_record(orphan) {
                        warn!(%orphan, error = %cleanup, "failed to drop unreferenced dedicated record");
                    }
                }
                return Err(e);
            }
        };
        directories.insert(file_id, directory_record);

        if let Some(stale) = stale {
            self.delete_dedicated(stale)?;
        }

        debug!(file_id, attribute_id, len = value.len(), ?location, "stored attribute");
        Ok(AttributeHandle {
            file_id,
            attribute_id,
            directory_record,
            location,
        })
    }

    /// Current value of the attribute; [`StorageError::AttributeNotFound`]
    /// when it was never written or has been deleted.
    pub fn read_value_from_storage(&self, file_id: u32, attribute_id: u32) -> StorageResult<Vec<u8>> {
        check_attribute_id(attribute_id)?;
        let not_found = StorageError::AttributeNotFound { file_id, attribute_id };
        let directories = self.directories.read();

        let Some(&directory_id) = directories.get(&file_id) else {
            return Err(not_found);
        };
        let directory = self.read_directory(directory_id, file_id)?;
        match directory.find(attribute_id) {
            None => Err(not_found),
            Some(StoredValue::Inline(bytes)) => Ok(bytes.clone()),
            Some(StoredValue::BlobBacked(id)) => self.read_dedicated(*id, file_id, attribute_id),
        }
    }

    pub fn exists_in_storage(&self, file_id: u32, attribute_id: u32) -> StorageResult<bool> {
        check_attribute_id(attribute_id)?;
        let directories = self.directories.read();

        let Some(&directory_id) = directories.get(&file_id) else {
            return Ok(false);
        };
        let directory = self.read_directory(directory_id, file_id)?;
        match directory.find(attribute_id) {
            None => Ok(false),
            Some(StoredValue::Inline(_)) => Ok(true),
            Some(StoredValue::BlobBacked(id)) => self.storage.has_record(*id),
        }
    }

    /// Delete one attribute. The file's directory record goes away with its
    /// last attribute.
    pub fn delete_record(&self, file_id: u32, attribute_id: u32) -> StorageResult<()> {
        check_attribute_id(attribute_id)?;
        let not_found = StorageError::AttributeNotFound { file_id, attribute_id };
        let mut directories = self.directories.write();

        let Some(&directory_id) = directories.get(&file_id) else {
            return Err(not_found);
        };
        let mut directory = self.read_directory(directory_id, file_id)?;
        let Some(removed) = directory.remove(attribute_id) else {
            return Err(not_found);
        };

        if directory.is_empty() {
            self.storage.delete_record(directory_id)?;
            directories.remove(&file_id);
        } else {
            let updated = self.storage.update_record(directory_id, &directory.encode())?;
            directories.insert(file_id, updated);
        }

        if let StoredValue::BlobBacked(id) = removed {
            self.delete_dedicated(id)?;
        }
        debug!(file_id, attribute_id, "deleted attribute");
        Ok(())
    }

    /// Delete every attribute of `file_id`. Returns false when the file had
    /// none.
    pub fn delete_attributes(&self, file_id: u32) -> StorageResult<bool> {
        let mut directories = self.directories.write();
        let Some(&directory_id) = directories.get(&file_id) else {
            return Ok(false);
        };
        let directory = self.read_directory(directory_id, file_id)?;

        for entry in &directory.entries {
            if let StoredValue::BlobBacked(id) = entry.value {
                self.delete_dedicated(id)?;
            }
        }
        self.storage.delete_record(directory_id)?;
        directories.remove(&file_id);

        debug!(file_id, attributes = directory.entries.len(), "deleted all attributes of file");
        Ok(true)
    }

    /// Visit every stored attribute in storage order.
    ///
    /// Inline values are reported with the id of their directory record,
    /// blob-backed values with the id of their dedicated record.
    pub fn for_each_attribute(&self, mut processor: impl FnMut(&AttributeVisit)) -> StorageResult<usize> {
        let mut visits = Vec::new();
        {
            let _guard = self.directories.read();
            let mut failure = None;
            self.storage.for_each(|info, payload| {
                if info.state != RecordState::Live {
                    return true;
                }
                match record_kind(payload) {
                    Some(RecordKind::Directory) => match DirectoryRecord::decode(info.id, payload) {
                        Ok(directory) => {
                            for entry in directory.entries {
                                if let StoredValue::Inline(value) = entry.value {
                                    visits.push(AttributeVisit {
                                        record_id: info.id,
                                        file_id: directory.file_id,
                                        attribute_id: entry.attribute_id,
                                        value,
                                        inlined: true,
                                    });
                                }
                            }
                        }
                        Err(e) => failure = Some(e),
                    },
                    Some(RecordKind::Dedicated) => match DedicatedRecord::decode(info.id, payload) {
                        Ok(record) => visits.push(AttributeVisit {
                            record_id: info.id,
                            file_id: record.file_id,
                            attribute_id: record.attribute_id,
                            value: record.value.to_vec(),
                            inlined: false,
                        }),
                        Err(e) => failure = Some(e),
                    },
                    None => failure = Some(StorageError::corrupted(info.id, "unknown attribute record kind")),
                }
                failure.is_none()
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        for visit in &visits {
            processor(visit);
        }
        Ok(visits.len())
    }

    /// Validate the attributes of one file: its directory record must
    /// decode and point back to the file, and every dedicated record it
    /// references must exist and point back to the file and attribute.
    pub fn check_file_sanity(&self, file_id: u32) -> StorageResult<SanityReport> {
        let directories = self.directories.read();
        let mut report = SanityReport::default();
        if let Some(&directory_id) = directories.get(&file_id) {
            self.check_directory(file_id, directory_id, &mut report)?;
        }
        Ok(report)
    }

    /// Validate every directory record and the dedicated records they
    /// reference, and look for dedicated records nothing references.
    pub fn check_sanity(&self) -> StorageResult<SanityReport> {
        let directories = self.directories.read();
        let mut report = SanityReport::default();
        let mut referenced = AHashSet::new();

        for (&file_id, &directory_id) in directories.iter() {
            for id in self.check_directory(file_id, directory_id, &mut report)? {
                referenced.insert(id);
            }
        }

        let mut orphan = None;
        self.storage.for_each(|info, payload| {
            if info.state == RecordState::Live
                && record_kind(payload) == Some(RecordKind::Dedicated)
                && !referenced.contains(&info.id)
            {
                orphan = Some(info.id);
                return false;
            }
            true
        })?;
        if let Some(id) = orphan {
            warn!(%id, "dedicated attribute record is not referenced by any directory");
            return Err(StorageError::corrupted(id, "dedicated record not referenced by any directory"));
        }

        Ok(report)
    }

    fn check_directory(
        &self,
        file_id: u32,
        directory_id: RecordId,
        report: &mut SanityReport,
    ) -> StorageResult<Vec<RecordId>> {
        let directory = self.read_directory(directory_id, file_id).inspect_err(|e| {
            warn!(file_id, %directory_id, error = %e, "invalid directory record");
        })?;
        if directory.is_empty() {
            return Err(StorageError::corrupted(directory_id, "empty directory record"));
        }

        let mut references = Vec::new();
        for entry in &directory.entries {
            match entry.value {
                StoredValue::Inline(_) => report.inline_attributes += 1,
                StoredValue::BlobBacked(id) => {
                    self.read_dedicated(id, file_id, entry.attribute_id)
                        .map_err(|e| match e {
                            StorageError::RecordNotFound { .. } => StorageError::corrupted(
                                directory_id,
                                format!(
                                    "attribute {} references missing record {}",
                                    entry.attribute_id, id
                                ),
                            ),
                            other => other,
                        })
                        .inspect_err(|e| warn!(file_id, attribute_id = entry.attribute_id, error = %e, "invalid dedicated record"))?;
                    report.dedicated_attributes += 1;
                    references.push(id);
                }
            }
        }
        report.directories += 1;
        Ok(references)
    }

    /// Client data format version, stored in the blob storage header
    pub fn version(&self) -> StorageResult<u32> {
        self.storage.data_format_version()
    }

    pub fn set_version(&self, version: u32) -> StorageResult<()> {
        let _guard = self.directories.write();
        self.storage.set_data_format_version(version)
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.storage.stats()?.live_records == 0)
    }

    pub fn is_dirty(&self) -> bool {
        self.storage.paged_storage().is_dirty()
    }

    pub fn stats(&self) -> StorageResult<AttributesStats> {
        let directories = self.directories.read();
        Ok(AttributesStats {
            files: directories.len(),
            blob: self.storage.stats()?,
        })
    }

    pub fn force(&self) -> StorageResult<()> {
        let _guard = self.directories.write();
        self.storage.force()
    }

    pub fn close(&self) -> StorageResult<()> {
        let _guard = self.directories.write();
        self.storage.close()
    }

    /// Close the storage and delete its file.
    pub fn close_and_clean(self) -> StorageResult<()> {
        let path = self.storage.paged_storage().path().to_path_buf();
        self.close()?;
        drop(self);
        fs::remove_file(&path)?;
        info!(path = %path.display(), "removed attributes storage");
        Ok(())
    }
}
