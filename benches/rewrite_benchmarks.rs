//! Benchmarks for the request path hot spots: rewriting and classification

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, UPGRADE};
use swagger_helper::config::ProxySettings;
use swagger_helper::dispatcher::Strategy;
use swagger_helper::rewrite::RewriteRules;

fn rules() -> RewriteRules {
    let settings = ProxySettings::new("http://backend:3000");
    let prefix = settings.prefix_rule();
    RewriteRules::compile([
        (prefix.pattern, prefix.replacement),
        ("/v1/*/orders/*".to_string(), "/api/v1/$1/orders/$2".to_string()),
        ("/legacy/*".to_string(), "/$1".to_string()),
        ("/health".to_string(), "/status".to_string()),
    ])
    .unwrap()
}

/// Benchmark rule matching
fn bench_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("rewrite");
    let rules = rules();

    group.bench_function("prefix_strip", |b| {
        b.iter(|| {
            black_box(rules.apply(black_box("/backend-api/v2/users/42")));
        });
    });

    group.bench_function("no_match", |b| {
        b.iter(|| {
            black_box(rules.apply(black_box("/index.html")));
        });
    });

    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    let mut upgrade = HeaderMap::new();
    upgrade.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
    upgrade.insert(UPGRADE, HeaderValue::from_static("websocket"));

    let mut event_stream = HeaderMap::new();
    event_stream.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

    group.bench_function("upgrade", |b| {
        b.iter(|| black_box(Strategy::classify(black_box(&upgrade))));
    });

    group.bench_function("event_stream", |b| {
        b.iter(|| black_box(Strategy::classify(black_box(&event_stream))));
    });

    group.finish();
}

criterion_group!(benches, bench_rewrite, bench_classify);
criterion_main!(benches);
