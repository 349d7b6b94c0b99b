use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::TempDir;
use vfsattrs::{BackendKind, StorageConfig, open_attributes_storage};

const WORKLOAD_SEED: u64 = 0xA77A;
const FILES: u32 = 1_000;
const ATTRIBUTES_PER_FILE: u32 = 4;
const SAMPLE_SIZE: usize = 20;
const WARM_UP: Duration = Duration::from_millis(300);
const MEASURE: Duration = Duration::from_millis(500);

/// `(file_id, attribute_id, value)` with mostly small values and some large
fn workload() -> Vec<(u32, u32, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(WORKLOAD_SEED);
    let mut ops = Vec::new();
    for file_id in 0..FILES {
        for attribute_id in 0..ATTRIBUTES_PER_FILE {
            let len = if rng.gen_bool(0.9) {
                rng.gen_range(0..64)
            } else {
                rng.gen_range(64..4096)
            };
            ops.push((file_id, attribute_id, (0..len).map(|_| rng.r#gen()).collect()));
        }
    }
    ops
}

fn bench_attributes(c: &mut Criterion) {
    let mut group = c.benchmark_group("attributes");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    let ops = workload();

    for (name, backend) in [("page_cache", BackendKind::PageCache), ("mmap", BackendKind::Mmap)] {
        let config = StorageConfig::new(backend);

        group.bench_function(BenchmarkId::new("write", name), |b| {
            b.iter(|| {
                let dir = TempDir::new().expect("tempdir");
                let attributes = open_attributes_storage(dir.path().join("bench.blobs"), &config).expect("storage");
                for (file_id, attribute_id, value) in &ops {
                    black_box(
                        attributes
                            .insert_or_update_record(*file_id, *attribute_id, value)
                            .expect("write"),
                    );
                }
                attributes.close().expect("close");
            });
        });

        let dir = TempDir::new().expect("tempdir");
        let attributes = open_attributes_storage(dir.path().join("bench.blobs"), &config).expect("storage");
        for (file_id, attribute_id, value) in &ops {
            attributes
                .insert_or_update_record(*file_id, *attribute_id, value)
                .expect("write");
        }
        group.bench_function(BenchmarkId::new("read", name), |b| {
            b.iter(|| {
                for (file_id, attribute_id, _) in &ops {
                    black_box(
                        attributes
                            .read_value_from_storage(*file_id, *attribute_id)
                            .expect("read"),
                    );
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_attributes);
criterion_main!(benches);
