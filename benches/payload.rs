//! Benchmarks for the per-call request path.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use ocr_relay::{GenerateContentRequest, ImagePayload, KeyPool, Rotation, RotationState};

fn benchmark_payload(c: &mut Criterion) {
    let bytes = vec![0x5a_u8; 256 * 1024];
    let encoded = ImagePayload::from_bytes(&bytes, "image/png").unwrap().data;
    let data_uri = format!("data:image/png;base64,{encoded}");

    let mut group = c.benchmark_group("payload");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("parse_data_uri", |b| {
        b.iter(|| ImagePayload::parse(&data_uri).unwrap());
    });

    let payload = ImagePayload::parse(&data_uri).unwrap();
    group.bench_function("serialize_request", |b| {
        b.iter(|| {
            let request = GenerateContentRequest::recognition("Extract the text", &payload, 0.2);
            serde_json::to_vec(&request).unwrap()
        });
    });

    group.finish();
}

fn benchmark_rotation(c: &mut Criterion) {
    let keys = (0..16).map(|i| format!("key-{i}")).collect::<Vec<_>>().join(",");
    let pool = KeyPool::parse(Some(&keys)).unwrap();

    let mut group = c.benchmark_group("rotation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("walk_exhausted_pool", |b| {
        b.iter(|| {
            let mut rotation = Rotation::start(3, pool.size());
            while let RotationState::Attempting { .. } = rotation.state() {
                rotation.record(ocr_relay::Decision::AdvanceAndRetry);
                rotation.resume();
            }
            rotation.state()
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_payload, benchmark_rotation);
criterion_main!(benches);
