// ABOUTME: Criterion benchmarks for the link framing codec hot path
// ABOUTME: Measures encode throughput and decode under whole and fragmented input

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use shiplink::codec::{self, Frame, FrameDecoder};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [64usize, 4096, 65536] {
        let frame = Frame::request(Bytes::from(vec![0u8; size]));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| codec::encode(black_box(frame)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode_single_push(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..64u8 {
        let frame = Frame::response(Bytes::from(vec![i; 1024]));
        stream.extend_from_slice(&codec::encode(&frame).unwrap());
    }
    c.bench_function("decode_64x1k_single_push", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let frames = decoder.push(black_box(&stream)).unwrap();
            assert_eq!(frames.len(), 64);
        });
    });
}

fn bench_decode_fragmented(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..16u8 {
        let frame = Frame::response(Bytes::from(vec![i; 1024]));
        stream.extend_from_slice(&codec::encode(&frame).unwrap());
    }
    c.bench_function("decode_16x1k_in_128b_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut recovered = 0;
            for chunk in stream.chunks(128) {
                recovered += decoder.push(black_box(chunk)).unwrap().len();
            }
            assert_eq!(recovered, 16);
        });
    });
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode_single_push,
    bench_decode_fragmented
);
criterion_main!(benches);
