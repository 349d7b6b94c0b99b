use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;
use vfsattrs::{BackendKind, RecordId, StorageConfig, open_blob_storage};

const PAYLOAD_SEED: u64 = 0xB10B;
const RECORDS: usize = 5_000;
const SAMPLE_SIZE: usize = 20;
const WARM_UP: Duration = Duration::from_millis(300);
const MEASURE: Duration = Duration::from_millis(500);

fn payloads(max_len: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(PAYLOAD_SEED + max_len as u64);
    (0..RECORDS)
        .map(|_| {
            let len = rng.gen_range(0..max_len);
            (0..len).map(|_| rng.r#gen()).collect()
        })
        .collect()
}

fn backends() -> [(&'static str, StorageConfig); 2] {
    [
        ("page_cache", StorageConfig::new(BackendKind::PageCache)),
        ("mmap", StorageConfig::new(BackendKind::Mmap)),
    ]
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_insert");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    for max_len in [64, 1024] {
        let data = payloads(max_len);
        for (name, config) in backends() {
            group.bench_function(BenchmarkId::new(name, max_len), |b| {
                b.iter(|| {
                    let dir = TempDir::new().expect("tempdir");
                    let storage = open_blob_storage(dir.path().join("bench.blobs"), &config).expect("storage");
                    for payload in &data {
                        black_box(storage.insert(payload).expect("insert"));
                    }
                    storage.close().expect("close");
                });
            });
        }
    }
    group.finish();
}

fn bench_read_and_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob_read_update");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    let data = payloads(512);
    for (name, config) in backends() {
        let dir = TempDir::new().expect("tempdir");
        let storage = open_blob_storage(dir.path().join("bench.blobs"), &config).expect("storage");
        let mut ids: Vec<RecordId> = data.iter().map(|p| storage.insert(p).expect("insert")).collect();

        group.bench_function(BenchmarkId::new("read", name), |b| {
            b.iter(|| {
                for id in &ids {
                    black_box(storage.read_record_with(*id, |bytes| bytes.len()).expect("read"));
                }
            });
        });

        group.bench_function(BenchmarkId::new("update", name), |b| {
            b.iter(|| {
                for (id, payload) in ids.iter_mut().zip(data.iter().rev()) {
                    *id = storage.update_record(*id, payload).expect("update");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_read_and_update);
criterion_main!(benches);
