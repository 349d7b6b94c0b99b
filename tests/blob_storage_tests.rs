//! Integration tests for the streamlined blob storage, run against every
//! backend and locking strategy.

use std::thread;
use tempfile::TempDir;
use vfsattrs::{
    PagedStorage, RecordId, RecordState, StorageConfig, StorageError, StreamlinedBlobStorage, AnyPagedStorage,
    open_blob_storage,
};

#[path = "storage_common.rs"]
mod storage_common;

use storage_common::{TEST_PAGE_SIZE, patch_file, storage_configs, storage_path};

fn open(dir: &TempDir, config: &StorageConfig) -> StreamlinedBlobStorage<AnyPagedStorage> {
    open_blob_storage(storage_path(dir, config), config).expect("Failed to open blob storage")
}

fn payload(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn test_insert_read_roundtrip() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let empty = storage.insert(&[]).unwrap();
        let small = storage.insert(b"attribute").unwrap();
        let large = storage.insert(&payload(3, 5000)).unwrap();

        assert_eq!(storage.read_record(empty).unwrap(), Vec::<u8>::new());
        assert_eq!(storage.read_record(small).unwrap(), b"attribute");
        assert_eq!(storage.read_record(large).unwrap(), payload(3, 5000));
        assert_eq!(storage.read_record_with(large, |bytes| bytes.len()).unwrap(), 5000);

        let stats = storage.stats().unwrap();
        assert_eq!(stats.live_records, 3);
        assert_eq!(stats.live_payload_bytes, 5009);
        assert!(stats.live_capacity_bytes >= stats.live_payload_bytes);
    }
}

#[test]
fn test_update_in_place_keeps_id() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        // 10 bytes reserve the 64 byte minimum
        let id = storage.insert(&payload(1, 10)).unwrap();
        let updated = storage.update_record(id, &payload(2, 60)).unwrap();
        assert_eq!(id, updated);
        assert_eq!(storage.read_record(id).unwrap(), payload(2, 60));

        let shrunk = storage.update_record(id, &payload(3, 5)).unwrap();
        assert_eq!(id, shrunk);
        assert_eq!(storage.read_record(id).unwrap(), payload(3, 5));
        assert_eq!(storage.stats().unwrap().live_payload_bytes, 5);
    }
}

#[test]
fn test_relocation_returns_new_id() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let id = storage.insert(&payload(1, 10)).unwrap();
        let neighbour = storage.insert(b"neighbour").unwrap();
        let relocated = storage.update_record(id, &payload(9, 3000)).unwrap();

        assert_ne!(id, relocated);
        assert_eq!(storage.read_record(relocated).unwrap(), payload(9, 3000));
        assert!(!storage.has_record(id).unwrap());
        assert!(matches!(
            storage.read_record(id),
            Err(StorageError::RecordNotFound { .. })
        ));
        assert_eq!(storage.read_record(neighbour).unwrap(), b"neighbour");

        let stats = storage.stats().unwrap();
        assert_eq!(stats.live_records, 2);
        assert_eq!(stats.reclaimable_records, 1);
    }
}

#[test]
fn test_relocation_with_redirect() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let id = storage.insert(b"v1").unwrap();
        let moved = storage.update_record_with_redirect(id, &payload(4, 700)).unwrap();

        assert_ne!(id, moved);
        assert!(storage.has_record(id).unwrap());
        assert_eq!(storage.resolve(id).unwrap(), Some(moved));
        assert_eq!(storage.read_record(id).unwrap(), payload(4, 700));

        // Deleting the old id only drops the redirect
        storage.delete_record(id).unwrap();
        assert!(!storage.has_record(id).unwrap());
        assert_eq!(storage.read_record(moved).unwrap(), payload(4, 700));
        assert_eq!(storage.stats().unwrap().live_records, 1);
    }
}

#[test]
fn test_update_through_redirect_repoints_head() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let head = storage.insert(b"v1").unwrap();
        let middle = storage.update_record_with_redirect(head, &payload(1, 500)).unwrap();
        let tail = storage.update_record(head, &payload(2, 2000)).unwrap();
        assert_ne!(tail, middle);
        assert_eq!(storage.resolve(head).unwrap(), Some(tail));

        // Same size class as the abandoned middle record
        let other = storage.insert(&[9u8; 450]).unwrap();
        assert_eq!(storage.read_record(other).unwrap(), vec![9u8; 450]);
        assert_eq!(storage.resolve(head).unwrap(), Some(tail));
        assert_eq!(storage.read_record(head).unwrap(), payload(2, 2000));
        assert_eq!(storage.read_record(tail).unwrap(), payload(2, 2000));
    }
}

#[test]
fn test_deleted_redirect_target_is_not_reused() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);

        let (head, target) = {
            let storage = open_blob_storage(&path, &config).unwrap();
            let head = storage.insert(b"v1").unwrap();
            let target = storage.update_record_with_redirect(head, &payload(1, 500)).unwrap();
            storage.delete_record(target).unwrap();
            assert_eq!(storage.stats().unwrap().reclaimable_records, 0);
            storage.close().unwrap();
            (head, target)
        };

        let storage = open_blob_storage(&path, &config).unwrap();
        assert_eq!(storage.stats().unwrap().reclaimable_records, 0);
        let other = storage.insert(&[9u8; 450]).unwrap();
        assert_ne!(other, target);
        assert!(!storage.has_record(head).unwrap());
        assert!(matches!(
            storage.read_record(head),
            Err(StorageError::RecordNotFound { .. })
        ));

        // Dropping the redirect releases both records
        storage.delete_record(head).unwrap();
        assert_eq!(storage.stats().unwrap().reclaimable_records, 2);
        let reused = storage.insert(&[7u8; 450]).unwrap();
        assert_eq!(reused, target);
        assert_eq!(storage.read_record(other).unwrap(), vec![9u8; 450]);
    }
}

#[test]
fn test_delete_errors() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let id = storage.insert(b"short lived").unwrap();
        storage.delete_record(id).unwrap();

        assert!(!storage.has_record(id).unwrap());
        let err = storage.read_record(id).unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            storage.delete_record(id),
            Err(StorageError::RecordAlreadyDeleted { .. })
        ));
        assert!(matches!(
            storage.update_record(id, b"again"),
            Err(StorageError::RecordNotFound { .. })
        ));

        let beyond = RecordId(id.as_u32() + 10_000);
        assert!(matches!(
            storage.delete_record(beyond),
            Err(StorageError::RecordNotFound { .. })
        ));
        assert!(!storage.has_record(RecordId::NULL).unwrap());
        assert!(storage.read_record(RecordId::NULL).is_err());
    }
}

#[test]
fn test_capacity_exceeded_leaves_storage_unchanged() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);
        let max = TEST_PAGE_SIZE - 8;

        let id = storage.insert(b"keep me").unwrap();
        let before = storage.stats().unwrap();

        let err = storage.insert(&vec![0u8; max + 1]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::CapacityExceeded { size, max_size } if size == max + 1 && max_size == max
        ));
        assert!(storage.update_record(id, &vec![0u8; max + 1]).is_err());

        assert_eq!(storage.stats().unwrap(), before);
        assert_eq!(storage.read_record(id).unwrap(), b"keep me");

        // The largest payload still fits
        let biggest = storage.insert(&vec![7u8; max]).unwrap();
        assert_eq!(storage.read_record(biggest).unwrap().len(), max);
    }
}

#[test]
fn test_reopen_preserves_records_and_counters() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);

        let mut ids = Vec::new();
        let stats = {
            let storage = open_blob_storage(&path, &config).unwrap();
            for i in 0..50u8 {
                ids.push(storage.insert(&payload(i, 100 + i as usize * 37)).unwrap());
            }
            storage.delete_record(ids[10]).unwrap();
            storage.set_data_format_version(7).unwrap();
            let stats = storage.stats().unwrap();
            storage.close().unwrap();
            stats
        };

        let storage = open_blob_storage(&path, &config).unwrap();
        assert_eq!(storage.stats().unwrap(), stats);
        assert_eq!(storage.data_format_version().unwrap(), 7);
        for (i, id) in ids.iter().enumerate() {
            if i == 10 {
                assert!(!storage.has_record(*id).unwrap());
            } else {
                assert_eq!(storage.read_record(*id).unwrap(), payload(i as u8, 100 + i * 37));
            }
        }
    }
}

#[test]
fn test_drop_closes_safely() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);

        let id = {
            let storage = open_blob_storage(&path, &config).unwrap();
            storage.insert(b"survives drop").unwrap()
        };

        let storage = open_blob_storage(&path, &config).unwrap();
        assert_eq!(storage.read_record(id).unwrap(), b"survives drop");
    }
}

#[test]
fn test_deleted_space_is_reused_after_reopen() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);

        let deleted = {
            let storage = open_blob_storage(&path, &config).unwrap();
            let first = storage.insert(&payload(1, 500)).unwrap();
            storage.insert(&payload(2, 500)).unwrap();
            storage.delete_record(first).unwrap();
            storage.close().unwrap();
            first
        };

        let storage = open_blob_storage(&path, &config).unwrap();
        assert_eq!(storage.stats().unwrap().reclaimable_records, 1);

        let size_before = storage.stats().unwrap().size_in_bytes;
        let reused = storage.insert(&payload(3, 480)).unwrap();
        assert_eq!(reused, deleted);
        assert_eq!(storage.read_record(reused).unwrap(), payload(3, 480));

        let stats = storage.stats().unwrap();
        assert_eq!(stats.reclaimable_records, 0);
        assert_eq!(stats.size_in_bytes, size_before);
        assert_eq!(stats.live_records, 2);
    }
}

#[test]
fn test_for_each_reports_every_record() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let mut live = Vec::new();
        for i in 0..40u8 {
            live.push((storage.insert(&payload(i, 900)).unwrap(), payload(i, 900)));
        }
        let (deleted, _) = live.remove(5);
        storage.delete_record(deleted).unwrap();

        let mut seen_live = Vec::new();
        let mut seen_deleted = Vec::new();
        let visited = storage
            .for_each(|info, bytes| {
                match info.state {
                    RecordState::Live => seen_live.push((info.id, bytes.to_vec())),
                    RecordState::Deleted => seen_deleted.push(info.id),
                    RecordState::Padding | RecordState::Moved => {}
                }
                true
            })
            .unwrap();

        assert!(visited >= 40);
        assert_eq!(seen_live, live);
        assert_eq!(seen_deleted, vec![deleted]);

        // Stopping early
        let mut count = 0;
        let visited = storage
            .for_each(|_, _| {
                count += 1;
                count < 3
            })
            .unwrap();
        assert_eq!(visited, 3);
    }
}

#[test]
fn test_unsafe_close_is_detected() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);

        let storage = open_blob_storage(&path, &config).unwrap();
        storage.insert(b"never safely closed").unwrap();
        storage.paged_storage().flush().unwrap();
        std::mem::forget(storage);

        let err = open_blob_storage(&path, &config).err().expect("open must fail");
        assert!(matches!(err, StorageError::NotClosedProperly { status: 0 }));
        assert!(err.is_initialization_failure());
    }
}

#[test]
fn test_corrupted_header_is_detected() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let path = storage_path(&dir, &config);
        open(&dir, &config).close().unwrap();

        patch_file(&path, 24, &[0xFF]);
        let err = open_blob_storage(&path, &config).err().expect("open must fail");
        assert!(matches!(err, StorageError::InvalidChecksum { .. }));

        patch_file(&path, 0, b"NOTBLOB!");
        let err = open_blob_storage(&path, &config).err().expect("open must fail");
        assert!(matches!(err, StorageError::InvalidMagic { .. }));
        assert!(err.is_initialization_failure());
    }
}

#[test]
fn test_page_size_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig::default().with_page_size(TEST_PAGE_SIZE);
    let path = storage_path(&dir, &config);
    open_blob_storage(&path, &config).unwrap().close().unwrap();

    let other = StorageConfig::default().with_page_size(4096);
    let err = open_blob_storage(&path, &other).err().expect("open must fail");
    assert!(matches!(err, StorageError::InvalidHeader { ref field, .. } if field == "page_size"));
}

#[test]
fn test_missing_file_without_create() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::default();
    config.create_if_missing = false;

    let result = open_blob_storage(dir.path().join("absent.blobs"), &config);
    assert!(matches!(result, Err(StorageError::Io(_))));
}

#[test]
fn test_operations_after_close_fail() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);
        let id = storage.insert(b"x").unwrap();

        storage.close().unwrap();
        storage.close().unwrap();
        assert!(storage.is_closed());
        assert!(matches!(storage.insert(b"y"), Err(StorageError::Closed)));
        assert!(matches!(storage.read_record(id), Err(StorageError::Closed)));
        assert!(matches!(storage.stats(), Err(StorageError::Closed)));
    }
}

#[test]
fn test_concurrent_writers_and_readers() {
    for config in storage_configs() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, &config);

        let shared: Vec<(RecordId, Vec<u8>)> = (0..32u8)
            .map(|i| (storage.insert(&payload(i, 300)).unwrap(), payload(i, 300)))
            .collect();

        let written: Vec<Vec<(RecordId, Vec<u8>)>> = thread::scope(|scope| {
            let writers: Vec<_> = (0..4u8)
                .map(|t| {
                    let storage = &storage;
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        for i in 0..100u8 {
                            let data = payload(t.wrapping_mul(50).wrapping_add(i), 20 + i as usize * 5);
                            let id = storage.insert(&data).unwrap();
                            let grown = payload(i, 40 + i as usize * 9);
                            let id = storage.update_record(id, &grown).unwrap();
                            mine.push((id, grown));
                        }
                        mine
                    })
                })
                .collect();

            for _ in 0..2 {
                let storage = &storage;
                let shared = &shared;
                scope.spawn(move || {
                    for _ in 0..20 {
                        for (id, expected) in shared {
                            assert_eq!(&storage.read_record(*id).unwrap(), expected);
                        }
                    }
                });
            }

            writers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        for (id, expected) in written.iter().flatten() {
            assert_eq!(&storage.read_record(*id).unwrap(), expected);
        }
        assert_eq!(storage.stats().unwrap().live_records, 32 + 400);
    }
}
