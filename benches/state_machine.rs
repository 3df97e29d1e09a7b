//! ホットパスのベンチマーク
//!
//! 鮮度判定・キー導出・ストアルックアップの1リクエストあたりの
//! コストを測定します。
//!
//! 使用方法:
//!   cargo bench --bench state_machine

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gracegate::cache::key::{CacheKey, CacheableMethod};
use gracegate::cache::object::{now_unix, CacheObject};
use gracegate::cache::state::{decide, Freshness};
use gracegate::cache::store::ObjectStore;
use std::sync::Arc;

fn benchmark_freshness_classify(c: &mut Criterion) {
    c.bench_function("freshness_classify", |b| {
        let mut age = 0u64;
        b.iter(|| {
            age = age.wrapping_add(37) % 1_000_000;
            black_box(Freshness::classify(black_box(age), 300, 86_400, 604_800))
        });
    });

    c.bench_function("decide", |b| {
        b.iter(|| {
            black_box(decide(black_box(Some(Freshness::StaleGrace)), black_box(true)))
        });
    });
}

fn benchmark_key_derivation(c: &mut Criterion) {
    let tracking: Vec<glob::Pattern> = ["utm_*", "gclid", "fbclid"]
        .iter()
        .map(|p| glob::Pattern::new(p).unwrap())
        .collect();

    c.bench_function("cache_key_plain", |b| {
        b.iter(|| {
            black_box(CacheKey::from_request(
                b"GET",
                black_box("www.example.com"),
                black_box("/blog/2024/some-post"),
                &tracking,
            ))
        });
    });

    c.bench_function("cache_key_with_query", |b| {
        b.iter(|| {
            black_box(CacheKey::from_request(
                b"GET",
                black_box("www.example.com:8080"),
                black_box("/search?utm_source=mail&q=rust&page=2&utm_campaign=x"),
                &tracking,
            ))
        });
    });
}

fn benchmark_store_lookup(c: &mut Criterion) {
    let store = ObjectStore::new(64 * 1024 * 1024);
    let mut keys = Vec::new();

    for i in 0..10_000 {
        let key = CacheKey::new(
            CacheableMethod::Get,
            "example.com",
            &format!("/page/{}", i),
            None,
        );
        let object = Arc::new(CacheObject::new(
            200,
            vec![(b"content-type".to_vec().into(), b"text/html".to_vec().into())],
            vec![0u8; 1024],
            300,
            86_400,
            604_800,
            "web01",
        ));
        store.insert(key.clone(), object);
        keys.push(key);
    }

    let now = now_unix();
    let mut i = 0usize;

    c.bench_function("store_lookup_hit", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            let object = store.lookup(black_box(&keys[i]));
            black_box(object.map(|o| Freshness::of(&o, now)))
        });
    });
}

criterion_group!(
    benches,
    benchmark_freshness_classify,
    benchmark_key_derivation,
    benchmark_store_lookup
);
criterion_main!(benches);
