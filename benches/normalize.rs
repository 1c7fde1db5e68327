//! Instance URL Normalization Benchmarks
//!
//! Normalization runs on every registry lookup, so it sits on the hot path
//! of every tool call. These benchmarks measure:
//! - Bare instance names (suffix expansion)
//! - Already-normalized URLs (the common repeat-lookup case)
//! - Messy input needing every rule

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nowgate::client::normalize_instance_url;

fn bench_bare_name(c: &mut Criterion) {
    c.bench_function("normalize_bare_name", |b| {
        b.iter(|| normalize_instance_url(black_box("dev12345")));
    });
}

fn bench_already_normalized(c: &mut Criterion) {
    c.bench_function("normalize_already_normalized", |b| {
        b.iter(|| normalize_instance_url(black_box("https://dev12345.service-now.com")));
    });
}

fn bench_messy_input(c: &mut Criterion) {
    c.bench_function("normalize_messy_input", |b| {
        b.iter(|| normalize_instance_url(black_box("  HTTP://Dev12345.Service-Now.COM///  ")));
    });
}

criterion_group!(benches, bench_bare_name, bench_already_normalized, bench_messy_input);
criterion_main!(benches);
