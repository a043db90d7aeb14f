use criterion::{black_box, criterion_group, criterion_main, Criterion};
use replicant::path;

fn bench_path_codec(c: &mut Criterion) {
    let deep: Vec<String> = (0..32).map(|i| format!("segment-{}", i)).collect();
    let deep_path = path::to_path_string(&deep);
    let slashed: Vec<String> = (0..8).map(|i| format!("a/b/{}", i)).collect();

    c.bench_function("to_segments deep", |b| {
        b.iter(|| path::to_segments(black_box(&deep_path)))
    });

    c.bench_function("to_path_string deep", |b| {
        b.iter(|| path::to_path_string(black_box(&deep)))
    });

    c.bench_function("to_path_string escaped", |b| {
        b.iter(|| path::to_path_string(black_box(&slashed)))
    });

    c.bench_function("round trip", |b| {
        b.iter(|| path::to_segments(&path::to_path_string(black_box(&slashed))))
    });
}

criterion_group!(benches, bench_path_codec);
criterion_main!(benches);
