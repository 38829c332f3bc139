use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use handle_ipc::core::envelope::{Envelope, Payload};
use handle_ipc::core::frame::FrameCodec;
use handle_ipc::Directory;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        let payload = Bytes::from(vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || payload.clone(),
                |payload| {
                    let mut buf = BytesMut::with_capacity(size + 8);
                    FrameCodec.encode(payload, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            let mut wire = BytesMut::new();
            FrameCodec.encode(payload.clone(), &mut wire).unwrap();
            b.iter_batched(
                || wire.clone(),
                |mut buf| {
                    let frame = FrameCodec.decode(&mut buf).unwrap();
                    assert!(frame.is_some());
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("envelope_{size}b"), |b| {
            let envelope = Envelope::new("bench", Payload::raw(payload.clone()));
            b.iter(|| envelope.to_bytes())
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    for &handles in &[10usize, 100, 1000] {
        let mut directory = Directory::new();
        for h in 0..handles {
            for port in 0..4u16 {
                let endpoint = format!("10.0.{}.{}:{}", h / 250, h % 250, 9000 + port);
                directory.insert(&format!("handle{h}"), endpoint.parse().unwrap());
            }
        }
        let text = directory.to_snapshot();

        group.bench_function(format!("serialize_{handles}"), |b| {
            b.iter(|| directory.to_snapshot())
        });
        group.bench_function(format!("parse_{handles}"), |b| {
            b.iter(|| Directory::parse(&text).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_snapshot);
criterion_main!(benches);
