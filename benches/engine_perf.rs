//! Engine throughput benches: create, ready query, cache rebuild, export.

use beads_core::sync::{self, ExportOptions};
use beads_core::util::id::IdConfig;
use beads_core::{
    Dependency, DependencyType, Issue, Priority, ReadyFilters, ReadySortPolicy, SqliteStorage,
};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn seeded_store(count: usize) -> SqliteStorage {
    let mut storage = SqliteStorage::open_memory().expect("open");
    let id_config = IdConfig::default();
    let mut previous: Option<String> = None;
    for n in 0..count {
        let mut input = Issue::new("", format!("benchmark issue {n}"));
        input.priority = Priority((n % 5) as i32);
        let issue = storage
            .create_issue(input, None, &id_config, &[], "bench")
            .expect("create");
        // A sparse chain of blockers keeps the graph realistic.
        if n % 7 == 0 {
            if let Some(prev) = &previous {
                storage
                    .add_dependency(
                        &Dependency::new(&issue.id, prev, DependencyType::Blocks),
                        "bench",
                    )
                    .expect("dep");
            }
        }
        previous = Some(issue.id);
    }
    storage
}

fn bench_create(c: &mut Criterion) {
    c.bench_function("create_issue", |b| {
        let mut storage = SqliteStorage::open_memory().expect("open");
        let id_config = IdConfig::default();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let issue = storage
                .create_issue(
                    Issue::new("", format!("bench create {n}")),
                    None,
                    &id_config,
                    &[],
                    "bench",
                )
                .expect("create");
            black_box(issue.id);
        });
    });
}

fn bench_ready_work(c: &mut Criterion) {
    let storage = seeded_store(500);
    c.bench_function("ready_work_500", |b| {
        b.iter(|| {
            let ready = storage
                .ready_work(&ReadyFilters::default(), ReadySortPolicy::Hybrid)
                .expect("ready");
            black_box(ready.len());
        });
    });
}

fn bench_cache_rebuild(c: &mut Criterion) {
    let mut storage = seeded_store(500);
    c.bench_function("blocked_cache_rebuild_500", |b| {
        b.iter(|| {
            let count = storage.rebuild_blocked_cache().expect("rebuild");
            black_box(count);
        });
    });
}

fn bench_export(c: &mut Criterion) {
    let mut storage = seeded_store(500);
    let dir = tempfile::TempDir::new().expect("tempdir");
    let mirror = dir.path().join("issues.jsonl");
    let opts = ExportOptions {
        force: true,
        ..ExportOptions::new(dir.path())
    };
    c.bench_function("export_full_500", |b| {
        b.iter(|| {
            let summary = sync::export_full(&mut storage, &mirror, &opts).expect("export");
            black_box(summary.written_ids.len());
        });
    });
}

criterion_group!(
    benches,
    bench_create,
    bench_ready_work,
    bench_cache_rebuild,
    bench_export
);
criterion_main!(benches);
