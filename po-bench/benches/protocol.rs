use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use po_core::{Encoding, UnitMetrics, STATE_SIZE};
use po_proto::{decode, encode, Advice, AdviceRequest, PeerMessage};

const ENCODINGS: [Encoding; 3] = [Encoding::Json, Encoding::Binary, Encoding::MsgPack];

fn make_step() -> PeerMessage {
    PeerMessage::Step {
        state: vec![0.1f32; STATE_SIZE],
        reward: None,
        metrics: Some(UnitMetrics {
            size: 4096.0,
            throughput: 812.5,
        }),
        done: false,
        response: None,
    }
}

fn make_request() -> AdviceRequest {
    AdviceRequest {
        embedding: vec![0.1f32; STATE_SIZE],
        reward: Some(0.25),
        ..Default::default()
    }
}

fn bench_codec(c: &mut Criterion) {
    let step = make_step();
    let req = make_request();

    let mut g = c.benchmark_group("po_proto_codec");
    for enc in ENCODINGS {
        g.bench_with_input(BenchmarkId::new("encode_step", enc), &step, |b, m| {
            b.iter(|| black_box(encode(enc, black_box(m)).unwrap()))
        });
        let bytes = encode(enc, &step).unwrap();
        g.bench_with_input(BenchmarkId::new("decode_step", enc), &bytes, |b, bytes| {
            b.iter(|| black_box(decode::<PeerMessage>(enc, black_box(bytes)).unwrap()))
        });
        let bytes = encode(enc, &req).unwrap();
        g.bench_with_input(BenchmarkId::new("decode_request", enc), &bytes, |b, bytes| {
            b.iter(|| black_box(decode::<AdviceRequest>(enc, black_box(bytes)).unwrap()))
        });
        g.bench_function(BenchmarkId::new("encode_advice", enc), |b| {
            b.iter(|| black_box(encode(enc, black_box(&Advice::act(7))).unwrap()))
        });
    }
    g.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
