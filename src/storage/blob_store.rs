//! Streamlined blob storage.
//!
//! Variable-size records packed into the pages of a [`PagedStorage`]. Every
//! record starts with an 8-byte header (`capacity`, `length`, `redirect_to`)
//! followed by `capacity` bytes of payload space. Records are appended at
//! the end of the file and never cross a page boundary: when the next record
//! doesn't fit into the current page, the page tail is filled with a padding
//! record and the record goes to the next page.
//!
//! Updates that fit into the reserved capacity are written in place. Larger
//! updates relocate the record; the old record becomes DELETED (its space is
//! reusable) or MOVED with a redirect to the new location.
//!
//! Writers are serialized by an internal mutex. Readers only take page locks,
//! so they run concurrently with each other and with writers touching other
//! pages.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::allocation::SpaceAllocationStrategy;
use super::constants::{self, file_status, max_record_capacity, record};
use super::header::{decode_header, encode_header};
use super::paged::PagedStorage;
use super::types::{BlobStorageStats, FileHeader, FileOffset, RecordHeader, RecordId, RecordInfo, RecordState};
use crate::errors::{StorageError, StorageResult};

/// Mutable allocator state, guarded by the writer mutex
struct AllocatorState {
    header: FileHeader,
    /// Deleted records by capacity
    free_records: BTreeMap<u16, Vec<RecordId>>,
    reclaimable: usize,
    /// Number of MOVED records pointing at each record. A targeted record
    /// stays off the free list even when deleted.
    redirect_targets: AHashMap<RecordId, u32>,
}

impl AllocatorState {
    fn push_free(&mut self, capacity: u16, id: RecordId) {
        self.free_records.entry(capacity).or_default().push(id);
        self.reclaimable += 1;
    }

    /// Put a deleted record on the free list unless a redirect still names it
    fn release(&mut self, capacity: u16, id: RecordId) {
        if self.redirect_targets.contains_key(&id) {
            debug!(%id, "deleted record is a redirect target, not reusable");
            return;
        }
        self.push_free(capacity, id);
    }

    fn add_redirect(&mut self, target: RecordId) {
        *self.redirect_targets.entry(target).or_default() += 1;
    }

    /// Returns true when the last redirect to `target` went away
    fn remove_redirect(&mut self, target: RecordId) -> bool {
        match self.redirect_targets.get_mut(&target) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.redirect_targets.remove(&target);
                true
            }
            None => false,
        }
    }

    /// Take a deleted record with capacity in `[required, 2 * required + 8]`
    fn take_free(&mut self, required: u16) -> Option<(RecordId, u16)> {
        let limit = (required as u32 * 2 + constants::OFFSET_BUCKET as u32).min(u16::MAX as u32) as u16;
        let (&capacity, ids) = self.free_records.range_mut(required..=limit).next()?;
        let id = ids.pop()?;
        if ids.is_empty() {
            self.free_records.remove(&capacity);
        }
        self.reclaimable -= 1;
        Some((id, capacity))
    }
}

/// Outcome of inspecting one record while following redirects
enum ReadStep<R> {
    Done(R),
    Redirect(RecordId),
    Missing,
    Corrupt(StorageError),
}

/// Blob storage over a paged backend.
///
/// ```no_run
/// use vfsattrs::storage::{
///     DataLengthPlusFixedPercentStrategy, FilePagedStorage, LockingStrategy,
///     StorageLockContext, StreamlinedBlobStorage,
/// };
///
/// let paged = FilePagedStorage::open(
///     "attributes.blobs",
///     64 * 1024,
///     StorageLockContext::shared(LockingStrategy::PerPage),
///     true,
/// )?;
/// let storage = StreamlinedBlobStorage::open(paged, Box::new(DataLengthPlusFixedPercentStrategy::default()))?;
/// let id = storage.insert(b"hello")?;
/// assert_eq!(storage.read_record(id)?, b"hello");
/// storage.close()?;
/// # Ok::<(), vfsattrs::StorageError>(())
/// ```
pub struct StreamlinedBlobStorage<P: PagedStorage> {
    paged: P,
    allocation: Box<dyn SpaceAllocationStrategy>,
    page_size: usize,
    state: Mutex<AllocatorState>,
    /// Mirror of `header.next_record_offset` for lock-free id range checks
    next_record_offset: AtomicU64,
    closed: AtomicBool,
}

impl<P: PagedStorage> StreamlinedBlobStorage<P> {
    /// Open a storage over `paged`.
    ///
    /// An all-zero header page means a fresh file, which gets a new header.
    /// Otherwise the header must carry the right magic, version and page
    /// size, a valid checksum and the SAFELY_CLOSED status. The free list is
    /// rebuilt by scanning every record.
    pub fn open(paged: P, allocation: Box<dyn SpaceAllocationStrategy>) -> StorageResult<Self> {
        let page_size = paged.page_size();
        if !page_size.is_power_of_two()
            || !(constants::MIN_PAGE_SIZE..=constants::MAX_PAGE_SIZE).contains(&page_size)
        {
            return Err(StorageError::invalid_config(format!(
                "page size {} must be a power of two in {}..={}",
                page_size,
                constants::MIN_PAGE_SIZE,
                constants::MAX_PAGE_SIZE
            )));
        }
        if allocation.max_capacity() > max_record_capacity(page_size) {
            return Err(StorageError::invalid_config(format!(
                "allocation max capacity {} doesn't fit into {} byte pages (limit {})",
                allocation.max_capacity(),
                page_size,
                max_record_capacity(page_size)
            )));
        }

        let header_bytes = paged.with_page(0, |page| page[..constants::HEADER_SIZE as usize].to_vec())?;
        let fresh = header_bytes.iter().all(|b| *b == 0);
        let mut header = if fresh {
            FileHeader::new(page_size as u32)
        } else {
            let header = decode_header(&header_bytes)?;
            header.validate(page_size)?;
            header.verify_checksum()?;
            if header.file_status != file_status::SAFELY_CLOSED {
                return Err(StorageError::NotClosedProperly {
                    status: header.file_status,
                });
            }
            header
        };
        header.file_status = file_status::OPENED;

        let storage = Self {
            paged,
            allocation,
            page_size,
            next_record_offset: AtomicU64::new(header.next_record_offset),
            state: Mutex::new(AllocatorState {
                header,
                free_records: BTreeMap::new(),
                reclaimable: 0,
                redirect_targets: AHashMap::new(),
            }),
            closed: AtomicBool::new(false),
        };

        {
            let mut state = storage.state.lock();
            storage.write_header(&mut state.header)?;
        }

        if !fresh {
            if let Err(e) = storage.rebuild_free_list() {
                // Leave the file as it is on disk; dropping must not force it
                storage.closed.store(true, Ordering::Release);
                return Err(e);
            }
        }

        {
            let state = storage.state.lock();
            info!(
                path = %storage.paged.path().display(),
                fresh,
                live_records = state.header.live_records(),
                reclaimable = state.reclaimable,
                "opened blob storage"
            );
        }

        Ok(storage)
    }

    fn rebuild_free_list(&self) -> StorageResult<()> {
        let mut free = Vec::new();
        let mut targets = Vec::new();
        self.scan(|info, _| {
            match info.state {
                RecordState::Deleted => free.push((info.capacity, info.id)),
                RecordState::Moved => targets.push(info.redirect_to),
                RecordState::Live | RecordState::Padding => {}
            }
            true
        })?;
        let mut state = self.state.lock();
        for target in targets {
            state.add_redirect(target);
        }
        for (capacity, id) in free {
            state.release(capacity, id);
        }
        Ok(())
    }

    /// Forget one redirect to `target`, freeing it when it was deleted and
    /// nothing points at it anymore
    fn drop_redirect(&self, state: &mut AllocatorState, target: RecordId) -> StorageResult<()> {
        if !state.remove_redirect(target) {
            return Ok(());
        }
        let header = self.read_record_header(target)?;
        if header.state() == RecordState::Deleted {
            state.push_free(header.capacity, target);
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn paged_storage(&self) -> &P {
        &self.paged
    }

    pub fn allocation_strategy(&self) -> &dyn SpaceAllocationStrategy {
        self.allocation.as_ref()
    }

    /// Largest payload a single record can hold
    pub fn max_payload_size(&self) -> usize {
        self.allocation.max_capacity() as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn locate(&self, offset: FileOffset) -> (u64, usize) {
        let page_size = self.page_size as u64;
        (offset / page_size, (offset % page_size) as usize)
    }

    fn check_record_id(&self, id: RecordId) -> StorageResult<()> {
        let offset = id.offset();
        if id.is_null()
            || offset < constants::HEADER_SIZE
            || offset >= self.next_record_offset.load(Ordering::Acquire)
        {
            return Err(StorageError::RecordNotFound { id });
        }
        Ok(())
    }

    fn write_header(&self, header: &mut FileHeader) -> StorageResult<()> {
        header.update_checksum();
        let bytes = encode_header(header);
        self.paged
            .with_page_mut(0, |page| page[..bytes.len()].copy_from_slice(&bytes))
    }

    /// First mutation after a `force()` marks the file OPENED again
    fn mark_modified(&self, state: &mut AllocatorState) -> StorageResult<()> {
        if state.header.file_status != file_status::OPENED {
            state.header.file_status = file_status::OPENED;
            self.write_header(&mut state.header)?;
        }
        Ok(())
    }

    fn read_record_header(&self, id: RecordId) -> StorageResult<RecordHeader> {
        self.check_record_id(id)?;
        let (page_no, in_page) = self.locate(id.offset());
        let page_size = self.page_size;
        self.paged.with_page(page_no, |page| {
            let header = RecordHeader::read_from(&page[in_page..]);
            header.check_bounds(id, in_page, page_size).map(|_| header)
        })?
    }

    fn write_record_header(&self, id: RecordId, header: RecordHeader) -> StorageResult<()> {
        let (page_no, in_page) = self.locate(id.offset());
        self.paged
            .with_page_mut(page_no, |page| header.write_to(&mut page[in_page..]))
    }

    fn write_record(&self, id: RecordId, header: RecordHeader, payload: &[u8]) -> StorageResult<()> {
        let (page_no, in_page) = self.locate(id.offset());
        self.paged.with_page_mut(page_no, |page| {
            header.write_to(&mut page[in_page..]);
            let start = in_page + record::HEADER_SIZE;
            page[start..start + payload.len()].copy_from_slice(payload);
        })
    }

    /// Place a new record, reusing deleted space when possible
    fn allocate_record(&self, state: &mut AllocatorState, payload: &[u8], capacity: u32) -> StorageResult<RecordId> {
        self.mark_modified(state)?;

        let required = (capacity as u64).next_multiple_of(constants::OFFSET_BUCKET) as u16;
        let length = payload.len() as u16;

        if let Some((id, reused_capacity)) = state.take_free(required) {
            self.write_record(id, RecordHeader::live(reused_capacity, length), payload)?;
            state.header.records_allocated += 1;
            state.header.live_payload_bytes += payload.len() as u64;
            state.header.live_capacity_bytes += reused_capacity as u64;
            debug!(%id, capacity = reused_capacity, required, "reused deleted record");
            return Ok(id);
        }

        let footprint = (record::HEADER_SIZE + required as usize) as u64;
        let mut offset = state.header.next_record_offset;
        let (page_no, in_page) = self.locate(offset);
        if in_page as u64 + footprint > self.page_size as u64 {
            let padding = (self.page_size - in_page - record::HEADER_SIZE) as u16;
            let padding_id = RecordId::from_offset(offset)?;
            self.write_record_header(padding_id, RecordHeader::padding(padding))?;
            offset = (page_no + 1) * self.page_size as u64;
        }

        let id = RecordId::from_offset(offset)?;
        self.write_record(id, RecordHeader::live(required, length), payload)?;

        state.header.next_record_offset = offset + footprint;
        self.next_record_offset
            .store(state.header.next_record_offset, Ordering::Release);
        state.header.records_allocated += 1;
        state.header.live_payload_bytes += payload.len() as u64;
        state.header.live_capacity_bytes += required as u64;
        Ok(id)
    }

    /// Follow MOVED redirects, starting at `id`, and apply `reader` to the
    /// payload of the live record at the end of the chain.
    fn follow<R>(&self, id: RecordId, reader: impl FnOnce(RecordId, &[u8]) -> R) -> StorageResult<Option<R>> {
        let page_size = self.page_size;
        let mut reader = Some(reader);
        let mut current = id;

        for _ in 0..constants::MAX_REDIRECT_HOPS {
            if current.is_null() {
                return Ok(None);
            }
            self.check_record_id(current)?;
            let (page_no, in_page) = self.locate(current.offset());
            let step = self.paged.with_page(page_no, |page| {
                let header = RecordHeader::read_from(&page[in_page..]);
                if let Err(e) = header.check_bounds(current, in_page, page_size) {
                    return ReadStep::Corrupt(e);
                }
                match header.state() {
                    RecordState::Live => {
                        let start = in_page + record::HEADER_SIZE;
                        let payload = &page[start..start + header.length as usize];
                        match reader.take() {
                            Some(reader) => ReadStep::Done(reader(current, payload)),
                            None => ReadStep::Missing,
                        }
                    }
                    RecordState::Moved => ReadStep::Redirect(header.redirect_to),
                    RecordState::Deleted | RecordState::Padding => ReadStep::Missing,
                }
            })?;

            match step {
                ReadStep::Done(result) => return Ok(Some(result)),
                ReadStep::Redirect(next) => current = next,
                ReadStep::Missing => return Ok(None),
                ReadStep::Corrupt(e) => return Err(e),
            }
        }

        Err(StorageError::corrupted(
            id,
            format!("more than {} redirects", constants::MAX_REDIRECT_HOPS),
        ))
    }

    /// Store `bytes` in a new record
    pub fn insert(&self, bytes: &[u8]) -> StorageResult<RecordId> {
        self.ensure_open()?;
        let capacity = self.allocation.capacity(bytes.len())?;
        let mut state = self.state.lock();
        self.allocate_record(&mut state, bytes, capacity)
    }

    pub fn read_record(&self, id: RecordId) -> StorageResult<Vec<u8>> {
        self.read_record_with(id, |bytes| bytes.to_vec())
    }

    /// Apply `reader` to the record payload without copying it.
    ///
    /// `reader` runs under the page lock and must not call into the storage.
    pub fn read_record_with<R>(&self, id: RecordId, reader: impl FnOnce(&[u8]) -> R) -> StorageResult<R> {
        self.ensure_open()?;
        self.follow(id, |_, bytes| reader(bytes))?
            .ok_or(StorageError::RecordNotFound { id })
    }

    /// Id of the live record `id` resolves to after redirects
    pub fn resolve(&self, id: RecordId) -> StorageResult<Option<RecordId>> {
        self.ensure_open()?;
        match self.follow(id, |actual, _| actual) {
            Err(StorageError::RecordNotFound { .. }) => Ok(None),
            other => other,
        }
    }

    /// True when `id` (after redirects) names a live record
    pub fn has_record(&self, id: RecordId) -> StorageResult<bool> {
        Ok(self.resolve(id)?.is_some())
    }

    /// Largest payload [`update_record`](Self::update_record) can store
    /// under `id` without relocating it
    pub fn record_capacity(&self, id: RecordId) -> StorageResult<usize> {
        self.ensure_open()?;
        let actual = self
            .follow(id, |actual, _| actual)?
            .ok_or(StorageError::RecordNotFound { id })?;
        Ok(self.read_record_header(actual)?.capacity as usize)
    }

    /// Replace the payload of record `id`.
    ///
    /// Returns the id the payload now lives under: `id` itself (or the end of
    /// its redirect chain) when the new payload fits, a fresh id otherwise.
    /// The old record is then DELETED and its space reusable. When `id` is
    /// a redirect, it is repointed at the new record.
    pub fn update_record(&self, id: RecordId, bytes: &[u8]) -> StorageResult<RecordId> {
        self.update(id, bytes, false)
    }

    /// Like [`update_record`](Self::update_record), but a relocated record
    /// leaves a MOVED redirect behind so `id` keeps resolving to the payload.
    pub fn update_record_with_redirect(&self, id: RecordId, bytes: &[u8]) -> StorageResult<RecordId> {
        self.update(id, bytes, true)
    }

    fn update(&self, id: RecordId, bytes: &[u8], leave_redirect: bool) -> StorageResult<RecordId> {
        self.ensure_open()?;
        self.allocation.check_length(bytes.len())?;

        let mut state = self.state.lock();
        let actual = self
            .follow(id, |actual, _| actual)?
            .ok_or(StorageError::RecordNotFound { id })?;
        let old = self.read_record_header(actual)?;

        if bytes.len() <= old.capacity as usize {
            self.mark_modified(&mut state)?;
            self.write_record(actual, RecordHeader::live(old.capacity, bytes.len() as u16), bytes)?;
            state.header.live_payload_bytes = state.header.live_payload_bytes - old.length as u64 + bytes.len() as u64;
            return Ok(actual);
        }

        let capacity = self.allocation.capacity(bytes.len())?;
        let new_id = self.allocate_record(&mut state, bytes, capacity)?;

        if leave_redirect {
            self.write_record_header(actual, RecordHeader::moved(old.capacity, new_id))?;
            state.header.records_relocated += 1;
            state.add_redirect(new_id);
        } else {
            self.write_record_header(actual, RecordHeader::deleted(old.capacity))?;
            state.header.records_deleted += 1;
            state.release(old.capacity, actual);
        }
        state.header.live_payload_bytes -= old.length as u64;
        state.header.live_capacity_bytes -= old.capacity as u64;

        if actual != id {
            // Point the chain head straight at the new record
            let head = self.read_record_header(id)?;
            self.write_record_header(id, RecordHeader::moved(head.capacity, new_id))?;
            state.add_redirect(new_id);
            self.drop_redirect(&mut state, head.redirect_to)?;
        }

        debug!(from = %actual, to = %new_id, leave_redirect, len = bytes.len(), "relocated record");
        Ok(new_id)
    }

    /// Delete record `id`. Redirects are not followed: deleting a MOVED
    /// record only deletes the redirect.
    pub fn delete_record(&self, id: RecordId) -> StorageResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let header = self.read_record_header(id)?;

        match header.state() {
            RecordState::Deleted => return Err(StorageError::RecordAlreadyDeleted { id }),
            RecordState::Padding => return Err(StorageError::RecordNotFound { id }),
            RecordState::Moved => {
                self.mark_modified(&mut state)?;
                self.write_record_header(id, RecordHeader::deleted(header.capacity))?;
                state.header.records_relocated = state.header.records_relocated.saturating_sub(1);
                state.header.records_deleted += 1;
                self.drop_redirect(&mut state, header.redirect_to)?;
            }
            RecordState::Live => {
                self.mark_modified(&mut state)?;
                self.write_record_header(id, RecordHeader::deleted(header.capacity))?;
                state.header.records_deleted += 1;
                state.header.live_payload_bytes -= header.length as u64;
                state.header.live_capacity_bytes -= header.capacity as u64;
            }
        }
        state.release(header.capacity, id);
        Ok(())
    }

    /// Visit every record in file order, padding included.
    ///
    /// `processor` receives the record info and the payload of live records
    /// (empty otherwise) and returns false to stop. It runs without any lock
    /// held. Returns the number of records visited.
    pub fn for_each(&self, processor: impl FnMut(&RecordInfo, &[u8]) -> bool) -> StorageResult<usize> {
        self.ensure_open()?;
        self.scan(processor)
    }

    fn scan(&self, mut processor: impl FnMut(&RecordInfo, &[u8]) -> bool) -> StorageResult<usize> {
        let end = self.next_record_offset.load(Ordering::Acquire);
        let page_size = self.page_size;
        let mut offset = constants::HEADER_SIZE;
        let mut visited = 0;

        // Every page but the last is filled up, by records or a padding tail
        while offset < end {
            let (page_no, first_in_page) = self.locate(offset);
            let page_start = page_no * page_size as u64;

            // Copy out the page's records, then process them unlocked
            let batch = self.paged.with_page(page_no, |page| -> StorageResult<Vec<(RecordInfo, Vec<u8>)>> {
                let mut batch = Vec::new();
                let mut in_page = first_in_page;
                while in_page < page_size && page_start + (in_page as u64) < end {
                    let id = RecordId::from_offset(page_start + in_page as u64)?;
                    let header = RecordHeader::read_from(&page[in_page..]);
                    header.check_bounds(id, in_page, page_size)?;
                    let start = in_page + record::HEADER_SIZE;
                    let payload = page[start..start + header.payload_len()].to_vec();
                    batch.push((
                        RecordInfo {
                            id,
                            state: header.state(),
                            capacity: header.capacity,
                            length: header.payload_len(),
                            redirect_to: header.redirect_to,
                        },
                        payload,
                    ));
                    in_page += header.footprint();
                }
                Ok(batch)
            })??;

            for (info, payload) in &batch {
                visited += 1;
                if !processor(info, payload) {
                    return Ok(visited);
                }
            }
            offset = page_start + page_size as u64;
        }

        Ok(visited)
    }

    pub fn data_format_version(&self) -> StorageResult<u32> {
        self.ensure_open()?;
        Ok(self.state.lock().header.data_format_version)
    }

    pub fn set_data_format_version(&self, version: u32) -> StorageResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.mark_modified(&mut state)?;
        state.header.data_format_version = version;
        self.write_header(&mut state.header)
    }

    pub fn stats(&self) -> StorageResult<BlobStorageStats> {
        self.ensure_open()?;
        let state = self.state.lock();
        let header = &state.header;
        Ok(BlobStorageStats {
            page_size: header.page_size,
            data_format_version: header.data_format_version,
            records_allocated: header.records_allocated,
            records_relocated: header.records_relocated,
            records_deleted: header.records_deleted,
            live_records: header.live_records(),
            live_payload_bytes: header.live_payload_bytes,
            live_capacity_bytes: header.live_capacity_bytes,
            reclaimable_records: state.reclaimable,
            size_in_bytes: header.next_record_offset,
        })
    }

    /// Write the header (SAFELY_CLOSED) and flush every page to disk
    pub fn force(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.header.file_status = file_status::SAFELY_CLOSED;
        self.write_header(&mut state.header)?;
        self.paged.flush()
    }

    /// Force and close. Later calls fail with [`StorageError::Closed`];
    /// closing twice is a no-op.
    pub fn close(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.force()?;
        self.closed.store(true, Ordering::Release);
        self.paged.close()?;
        info!(path = %self.paged.path().display(), "closed blob storage");
        Ok(())
    }
}

impl<P: PagedStorage> Drop for StreamlinedBlobStorage<P> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(path = %self.paged.path().display(), error = %e, "failed to close blob storage on drop");
            }
        }
    }
}
