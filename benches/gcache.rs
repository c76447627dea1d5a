// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! gcache allocation and release throughput.
//!
//! Measures `malloc`/`seqno_assign`/`free` cost in the steady state
//! where every allocation fits the ring buffer, and `seqno_release`
//! batching cost once a long run of buffers is ready to discard.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box as bb;
use tempfile::tempdir;
use wscore::config::GcacheConfig;
use wscore::gcache::GCache;
use wscore::gtid::Seqno;

fn config_in(dir: &std::path::Path) -> GcacheConfig {
    GcacheConfig::default()
        .with_name(dir.join("gcache"))
        .with_size(16 * 1024 * 1024)
}

fn bench_malloc_assign_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("gcache_malloc_assign_free");
    for size in [64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = tempdir().expect("tempdir");
            let config = config_in(dir.path());
            let mut cache = GCache::open(&config).expect("gcache open");
            let mut seqno = 1i64;
            b.iter(|| {
                let id = cache.malloc(size).expect("malloc");
                cache.seqno_assign(id, Seqno::new(seqno), -1);
                cache.free(id);
                bb(seqno);
                seqno += 1;
            });
        });
    }
    group.finish();
}

fn bench_seqno_release_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("gcache_seqno_release");
    group.bench_function("release_1000_released_buffers", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                let config = config_in(dir.path());
                let mut cache = GCache::open(&config).expect("gcache open");
                for seqno in 1..=1000i64 {
                    let id = cache.malloc(64).expect("malloc");
                    cache.seqno_assign(id, Seqno::new(seqno), -1);
                    cache.free(id);
                }
                (dir, cache)
            },
            |(_dir, mut cache)| {
                cache.seqno_release(Seqno::new(1000));
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

criterion_group!(gcache_benches, bench_malloc_assign_free, bench_seqno_release_batching);
criterion_main!(gcache_benches);
