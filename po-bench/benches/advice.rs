use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use po_core::{RewardConfig, ACTION_SPACE_SIZE, STATE_SIZE};
use po_policy::FixedPolicy;
use po_proto::AdviceRequest;
use po_runtime::EpisodeParams;
use po_serve::{AdviceService, Advisor};

/// Full remote-call episode (store lookup, state machine, policy) without sockets.
fn bench_episode(c: &mut Criterion) {
    let params = EpisodeParams {
        state_len: STATE_SIZE,
        reward: RewardConfig::default(),
    };
    let policy = Arc::new(FixedPolicy::new(3, STATE_SIZE, ACTION_SPACE_SIZE));
    let svc = AdviceService::new(Arc::new(Advisor::new(policy, params, None)));
    let step = AdviceRequest {
        embedding: vec![0.1; STATE_SIZE],
        reward: Some(0.5),
        ..Default::default()
    };
    let done = AdviceRequest {
        done: true,
        response: Some(b"ok".to_vec()),
        ..Default::default()
    };

    c.bench_function("po_serve_episode_10_steps", |b| {
        b.iter(|| {
            for _ in 0..10 {
                black_box(svc.get_advice(1, black_box(&step)));
            }
            black_box(svc.get_advice(1, &done))
        })
    });
}

criterion_group!(benches, bench_episode);
criterion_main!(benches);
