use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pumpkin::artifacts::{dir_name, sanitize_url};
use pumpkin::har;

fn bench_sanitize_url(c: &mut Criterion) {
    let url = "https://sub.example.com:8443/a/long/path?q=1&page=2#frag";
    c.bench_function("sanitize_url", |b| {
        b.iter(|| sanitize_url(black_box(url)));
    });
}

fn bench_dir_name(c: &mut Criterion) {
    let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 20, 30).unwrap();
    c.bench_function("dir_name", |b| {
        b.iter(|| dir_name(black_box("https://example.com/products?page=3"), now));
    });
}

fn bench_har_analysis(c: &mut Criterion) {
    let entries: Vec<String> = (0..200)
        .map(|i| {
            let status = match i % 10 {
                0 => 404,
                1 => 500,
                _ => 200,
            };
            format!(
                r#"{{"startedDateTime":"2025-06-01T00:00:00.000Z","time":12.5,
                    "request":{{"method":"GET","url":"https://cdn.example/asset-{i}"}},
                    "response":{{"status":{status},"statusText":"","content":{{"size":1024,"mimeType":"text/css"}}}}}}"#
            )
        })
        .collect();
    let har = format!(
        r#"{{"log":{{"version":"1.2","creator":{{"name":"bench","version":"0"}},"entries":[{}]}}}}"#,
        entries.join(",")
    );
    let bytes = har.into_bytes();

    c.bench_function("har_analyze_200_entries", |b| {
        b.iter(|| har::analyze_bytes(black_box(&bytes)));
    });
}

criterion_group!(
    benches,
    bench_sanitize_url,
    bench_dir_name,
    bench_har_analysis
);
criterion_main!(benches);
