//! Micro-benchmarks for `lsmkv` core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro          # run all micro-benchmarks
//! cargo bench --bench micro -- put   # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use lsmkv::{Store, StoreConfig};
use tempfile::TempDir;

const VALUE_128B: &str = "V-128-01234567890123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890123456789012345";
const VALUE_1K_LEN: usize = 1024;

fn value_1k() -> String {
    "x".repeat(VALUE_1K_LEN)
}

fn make_key(i: u64) -> String {
    format!("key-{i:012}")
}

/// Large memtable so benchmarked puts never trigger a flush — isolates the
/// WAL-append-plus-memtable-insert cost from background I/O.
fn open_memtable_only(dir: &std::path::Path) -> Store {
    Store::open(
        dir,
        StoreConfig {
            memtable_size: 1_000_000,
            ..StoreConfig::default()
        },
    )
    .expect("open")
}

/// Tiny memtable so sustained puts trigger frequent flushes to L0.
fn open_small_memtable(dir: &std::path::Path) -> Store {
    Store::open(
        dir,
        StoreConfig {
            memtable_size: 64,
            max_l0_sstables: 8,
            ..StoreConfig::default()
        },
    )
    .expect("open")
}

/// Pre-populates a store with `count` sequential keys, flushes, and closes
/// it so on-disk runs exist for the next open.
fn prepopulate(dir: &std::path::Path, count: u64, value: &str) {
    let store = open_small_memtable(dir);
    for i in 0..count {
        store.put(&make_key(i), value).unwrap();
    }
    store.flush().ok();
    store.close().unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

/// ## `memtable_only/128B` and `memtable_only/1K`
/// Put latency with a memtable large enough that no flush occurs —
/// isolates the WAL-append-plus-insert cost from background I/O. Expect
/// the cost to be dominated by the WAL's `fsync`, with value size a minor
/// contributor.
///
/// ## `sequential_with_flush`
/// Put latency with a tiny memtable, so flushes interleave with writes.
/// Reflects a sustained write-heavy workload.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    let value_1k = value_1k();

    for &(label, value) in &[("128B", VALUE_128B), ("1K", value_1k.as_str())] {
        group.bench_function(BenchmarkId::new("memtable_only", label), |b| {
            let dir = TempDir::new().unwrap();
            let store = open_memtable_only(dir.path());
            let mut seq = 0u64;
            b.iter(|| {
                let key = make_key(seq);
                store.put(black_box(&key), black_box(value)).unwrap();
                seq += 1;
            });
            store.close().unwrap();
        });
    }

    group.bench_function("sequential_with_flush", |b| {
        let dir = TempDir::new().unwrap();
        let store = open_small_memtable(dir.path());
        let mut seq = 0u64;
        b.iter(|| {
            let key = make_key(seq);
            store.put(black_box(&key), black_box(VALUE_128B)).unwrap();
            seq += 1;
        });
        store.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

/// ## `memtable_hit` / `memtable_miss`
/// Point-lookup latency against 10,000 keys resident in the active
/// memtable. A miss should be no slower than a hit — both are a single
/// `BTreeMap` lookup.
///
/// ## `run_hit` / `run_miss`
/// Point-lookup latency after a reopen, so every key lives in on-disk
/// runs. A miss should be faster than a hit: the bloom filter rejects
/// most absent keys before the data file is ever touched.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    const N: u64 = 10_000;

    {
        let dir = TempDir::new().unwrap();
        let store = open_memtable_only(dir.path());
        for i in 0..N {
            store.put(&make_key(i), VALUE_128B).unwrap();
        }
        group.bench_function("memtable_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = make_key(i % N);
                black_box(store.get(&key).unwrap());
                i += 1;
            });
        });
        group.bench_function("memtable_miss", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = make_key(N + (i % N));
                black_box(store.get(&key).unwrap());
                i += 1;
            });
        });
        store.close().unwrap();
    }

    {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), N, VALUE_128B);
        let store = Store::open(dir.path(), StoreConfig::default()).unwrap();
        group.bench_function("run_hit", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = make_key(i % N);
                black_box(store.get(&key).unwrap());
                i += 1;
            });
        });
        group.bench_function("run_miss", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let key = make_key(N + (i % N));
                black_box(store.get(&key).unwrap());
                i += 1;
            });
        });
        store.close().unwrap();
    }

    group.finish();
}

// ================================================================================================
// Compaction benchmark
// ================================================================================================

/// Cost of a manual full compaction over a store with several L0 runs —
/// measures the merge-and-republish path end to end, excluding the writes
/// that produced the runs.
fn bench_compaction(c: &mut Criterion) {
    c.bench_function("compact/4_runs_of_256", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store = Store::open(
                    dir.path(),
                    StoreConfig {
                        memtable_size: 256,
                        max_l0_sstables: 100, // Avoid triggering compaction during setup.
                        ..StoreConfig::default()
                    },
                )
                .unwrap();
                for batch in 0..4u64 {
                    for i in 0..256u64 {
                        store.put(&make_key(batch * 256 + i), VALUE_128B).unwrap();
                    }
                    store.flush().unwrap();
                }
                (dir, store)
            },
            |(_dir, store)| {
                store.compact().unwrap();
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_put, bench_get, bench_compaction);
criterion_main!(benches);
