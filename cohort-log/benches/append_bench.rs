use cohort_log::{Hlc, LogConfig, SegmentStore};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tempfile::TempDir;

fn bench_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = SegmentStore::open(
        dir.path(),
        LogConfig {
            max_logs: 4,
            segment_bytes: 1 << 20,
            address_space_bytes: 1 << 30,
        },
    )
    .unwrap();

    let payload = vec![0xA5u8; 1024];

    c.bench_function("append_1k", |b| {
        let log = store.open_log("bench").unwrap();
        let mut version = log.latest_version();
        b.iter(|| {
            version += 1;
            log.append(black_box(&payload), version, Hlc::new(version as u64, 0))
                .unwrap();
        })
    });

    c.bench_function("append_1k_persist_every_64", |b| {
        let log = store.open_log("bench_persist").unwrap();
        let mut version = log.latest_version();
        b.iter(|| {
            version += 1;
            log.append(black_box(&payload), version, Hlc::new(version as u64, 0))
                .unwrap();
            if version % 64 == 0 {
                log.persist().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
