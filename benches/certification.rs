// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Certification index throughput.
//!
//! Measures `append_trx` cost under different key-collision rates: a
//! disjoint-key workload (no conflicts, index grows unbounded until
//! eviction kicks in) versus a hot-key workload (every writeset touches
//! a small, shared key space, maximizing matrix-evaluation work).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box as bb;
use wscore::cert::CertIndex;
use wscore::config::CertConfig;
use wscore::keys::{Key, KeyPart, KeySet, KeyType};
use wscore::writeset::{WsFlags, Writeset};

fn make_ws(seqno: i64, source_id: u64, key: &[u8], ty: KeyType) -> Writeset {
    let part = KeyPart::new(key.to_vec(), ty);
    let keyset = KeySet::new(vec![Key::new(vec![part])]);
    Writeset::new(
        seqno.into(),
        seqno.into(),
        (seqno - 1).into(),
        source_id,
        4,
        WsFlags::empty(),
        keyset,
        64,
    )
}

fn bench_disjoint_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("certification_disjoint_keys");
    group.bench_function("append_trx", |b| {
        b.iter_batched(
            || CertIndex::new(CertConfig::default()),
            |mut index| {
                for i in 1..=1000i64 {
                    let key = format!("row{i}");
                    let ws = make_ws(i, 1, key.as_bytes(), KeyType::Exclusive);
                    bb(index.append_trx(ws).expect("disjoint keys never conflict"));
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_hot_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("certification_hot_keys");
    for hot_set_size in [1usize, 16, 256] {
        group.bench_with_input(
            BenchmarkId::from_parameter(hot_set_size),
            &hot_set_size,
            |b, &hot_set_size| {
                b.iter_batched(
                    || CertIndex::new(CertConfig::default()),
                    |mut index| {
                        let mut seqno = 1i64;
                        for _ in 0..1000 {
                            let key = format!("hot{}", seqno as usize % hot_set_size.max(1));
                            let ws = make_ws(seqno, 1, key.as_bytes(), KeyType::Shared);
                            // Same source id and SHARED type never conflicts (§4.1 matrix N cells).
                            bb(index.append_trx(ws).expect("shared keys from one source never conflict"));
                            seqno += 1;
                        }
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(cert_benches, bench_disjoint_keys, bench_hot_keys);
criterion_main!(cert_benches);
