//! Tree operation benchmarks for Arbor.
//!
//! Measures the hot paths of both variants: point inserts, point reads and
//! ascending scans, at sizes small enough for a quick signal and large
//! enough to cross bucket splits.

use std::sync::Arc;

use arbor::{AtomicOperationsManager, BonsaiTree, FileLockManager, SbTree};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::tempdir;

fn bench_bonsai_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("bonsai_insert");

    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("sequential", count),
            &count,
            |b, &count| {
                b.iter_with_setup(
                    || {
                        let dir = tempdir().unwrap();
                        let tree = BonsaiTree::<i32, i64>::create(
                            dir.path().join("bench.arb"),
                            "bench",
                            8192,
                            Arc::new(FileLockManager::new()),
                            Arc::new(AtomicOperationsManager::new()),
                        )
                        .unwrap();
                        (dir, tree)
                    },
                    |(_dir, tree)| {
                        for key in 0..count {
                            tree.put(&key, &(key as i64)).unwrap();
                        }
                    },
                );
            },
        );
    }
    group.finish();
}

fn bench_bonsai_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let tree = BonsaiTree::<i32, i64>::create(
        dir.path().join("bench.arb"),
        "bench",
        8192,
        Arc::new(FileLockManager::new()),
        Arc::new(AtomicOperationsManager::new()),
    )
    .unwrap();
    for key in 0..10_000 {
        tree.put(&key, &(key as i64)).unwrap();
    }

    c.bench_function("bonsai_get", |b| {
        let mut key = 0;
        b.iter(|| {
            key = (key + 7_919) % 10_000;
            black_box(tree.get(&key).unwrap());
        });
    });
}

fn bench_bonsai_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let tree = BonsaiTree::<i32, i64>::create(
        dir.path().join("bench.arb"),
        "bench",
        8192,
        Arc::new(FileLockManager::new()),
        Arc::new(AtomicOperationsManager::new()),
    )
    .unwrap();
    for key in 0..10_000 {
        tree.put(&key, &(key as i64)).unwrap();
    }

    let mut group = c.benchmark_group("bonsai_scan");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("full_forward", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            tree.load_entries_major(&0, true, true, |entry| {
                sum += entry.value.unwrap();
                true
            })
            .unwrap();
            black_box(sum);
        });
    });
    group.finish();
}

fn bench_sbtree_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("sbtree_insert");

    group.throughput(Throughput::Elements(5_000));
    group.bench_function("sequential", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let tree = SbTree::<i32, String>::create(
                    dir.path().join("bench.arb"),
                    "bench",
                    None,
                    Arc::new(FileLockManager::new()),
                    Arc::new(AtomicOperationsManager::new()),
                )
                .unwrap();
                (dir, tree)
            },
            |(_dir, tree)| {
                for key in 0..5_000 {
                    tree.put(&key, &format!("value-{key}")).unwrap();
                }
            },
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_bonsai_insert,
    bench_bonsai_get,
    bench_bonsai_scan,
    bench_sbtree_insert
);
criterion_main!(benches);
