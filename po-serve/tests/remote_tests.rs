use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use po_core::{Encoding, Endpoint, RewardConfig, ACTION_SPACE_SIZE};
use po_policy::FixedPolicy;
use po_proto::AdviceRequest;
use po_runtime::{lock_episode, EpisodeParams, EpisodePhase};
use po_serve::{AdviceClient, AdviceServer, AdviceService, Advisor};

const N: usize = 8;

fn advisor() -> Arc<Advisor> {
    let params = EpisodeParams {
        state_len: N,
        reward: RewardConfig::default(),
    };
    let policy = Arc::new(FixedPolicy::new(3, N, ACTION_SPACE_SIZE));
    Arc::new(Advisor::new(policy, params, None))
}

fn observe(done: bool) -> AdviceRequest {
    AdviceRequest {
        embedding: if done { vec![] } else { vec![0.1; N] },
        reward: Some(0.5),
        done,
        response: done.then(|| b"compiled".to_vec()),
        ..Default::default()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn three_calls_yield_3_3_terminal_and_empty_store() {
    let svc = AdviceService::new(advisor());

    let a0 = svc.get_advice(1, &observe(false));
    let a1 = svc.get_advice(1, &observe(false));
    let a2 = svc.get_advice(1, &observe(true));

    assert_eq!([a0.action, a1.action, a2.action], [3, 3, -1]);
    assert!(svc.advisor().store().is_empty());

    // Same id again: a brand-new episode, reset from this embedding.
    let again = svc.get_advice(1, &observe(false));
    assert_eq!(again.action, 3);
    let h = svc.advisor().store().get(1).unwrap();
    let ep = lock_episode(&h);
    assert_eq!(ep.step_count(), 1);
    assert_eq!(ep.phase(), EpisodePhase::AwaitingObservation);
    assert_eq!(svc.advisor().store().episodes_created(), 2);
}

#[test]
fn cumulative_reward_tracks_reported_rewards() {
    let svc = AdviceService::new(advisor());
    svc.get_advice(4, &observe(false));
    svc.get_advice(4, &observe(false));
    svc.get_advice(4, &observe(false));
    let h = svc.advisor().store().get(4).unwrap();
    assert!((lock_episode(&h).cumulative_reward() - 1.0).abs() < 1e-9);
}

#[test]
fn concurrent_sessions_run_independently() {
    let svc = AdviceService::new(advisor());
    let handles: Vec<_> = (0..8u64)
        .map(|session| {
            let svc = svc.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                for i in 0..5 {
                    got.push(svc.get_advice(session, &observe(false)).action);
                    if i % 2 == 0 {
                        thread::yield_now();
                    }
                }
                got.push(svc.get_advice(session, &observe(true)).action);
                got
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), vec![3, 3, 3, 3, 3, -1]);
    }
    assert!(svc.advisor().store().is_empty());
    assert_eq!(svc.advisor().store().episodes_created(), 8);
}

fn run_server(endpoint: Endpoint, enc: Encoding) -> (Endpoint, Arc<Advisor>, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let adv = advisor();
    let server = AdviceServer::bind(&endpoint).unwrap();
    let local = server.local_endpoint().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let svc = AdviceService::new(Arc::clone(&adv));
    let flag = Arc::clone(&shutdown);
    let h = thread::spawn(move || server.serve(svc, enc, flag).unwrap());
    (local, adv, shutdown, h)
}

#[test]
fn tcp_server_runs_episodes_per_connection() {
    let (ep, adv, shutdown, h) = run_server(Endpoint::Tcp("127.0.0.1:0".to_string()), Encoding::Binary);

    let mut c = AdviceClient::connect(&ep, Encoding::Binary).unwrap();
    assert_eq!(c.begin(Some("a.ll"), vec![0.0; N]).unwrap().action, 3);
    assert_eq!(c.get_advice(&observe(false)).unwrap().action, 3);
    assert!(c.get_advice(&observe(true)).unwrap().is_terminal());
    // Second episode on the same connection.
    assert_eq!(c.begin(Some("b.ll"), vec![0.0; N]).unwrap().action, 3);

    let mut other = AdviceClient::connect(&ep, Encoding::Binary).unwrap();
    assert_eq!(other.begin(None, vec![1.0; N]).unwrap().action, 3);
    assert_eq!(adv.store().len(), 2);

    // Dropping a connection drops its live episode.
    drop(c);
    wait_until(|| adv.store().len() == 1);

    // Bad embedding: the peer sees stop, not a dead socket.
    assert!(other.get_advice(&observe(false)).is_ok());
    let bad = AdviceRequest {
        embedding: vec![0.0; N - 1],
        ..Default::default()
    };
    assert!(other.get_advice(&bad).unwrap().is_terminal());
    assert_eq!(other.begin(None, vec![1.0; N]).unwrap().action, 3);

    drop(other);
    wait_until(|| adv.store().is_empty());
    shutdown.store(true, Ordering::Relaxed);
    h.join().unwrap();
}

#[test]
fn malformed_request_answers_terminal_and_keeps_connection() {
    use std::io::Write;
    use std::net::TcpStream;

    let (ep, _adv, shutdown, h) = run_server(Endpoint::Tcp("127.0.0.1:0".to_string()), Encoding::Json);
    let Endpoint::Tcp(addr) = &ep else {
        unreachable!()
    };
    let mut raw = TcpStream::connect(addr).unwrap();
    po_proto::write_frame(&mut raw, b"[1,2").unwrap();
    raw.flush().unwrap();
    let reply: po_proto::Advice = po_proto::recv(&mut raw, Encoding::Json).unwrap();
    assert!(reply.is_terminal());

    po_proto::send(&mut raw, Encoding::Json, &observe(false)).unwrap();
    let reply: po_proto::Advice = po_proto::recv(&mut raw, Encoding::Json).unwrap();
    assert_eq!(reply.action, 3);

    drop(raw);
    shutdown.store(true, Ordering::Relaxed);
    h.join().unwrap();
}

#[test]
fn oversized_length_prefix_gets_terminal_before_close() {
    use std::io::Write;
    use std::net::TcpStream;

    let (ep, adv, shutdown, h) = run_server(Endpoint::Tcp("127.0.0.1:0".to_string()), Encoding::Json);
    let Endpoint::Tcp(addr) = &ep else {
        unreachable!()
    };
    let mut raw = TcpStream::connect(addr).unwrap();
    po_proto::send(&mut raw, Encoding::Json, &observe(false)).unwrap();
    let reply: po_proto::Advice = po_proto::recv(&mut raw, Encoding::Json).unwrap();
    assert_eq!(reply.action, 3);
    assert_eq!(adv.store().len(), 1);

    raw.write_all(&u32::MAX.to_le_bytes()).unwrap();
    raw.flush().unwrap();
    let reply: po_proto::Advice = po_proto::recv(&mut raw, Encoding::Json).unwrap();
    assert!(reply.is_terminal());
    // Framing is gone, so the server hangs up after the terminal reply.
    assert!(po_proto::recv::<_, po_proto::Advice>(&mut raw, Encoding::Json).is_err());
    wait_until(|| adv.store().is_empty());

    drop(raw);
    shutdown.store(true, Ordering::Relaxed);
    h.join().unwrap();
}

#[test]
fn unix_socket_server_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("advisor.sock");
    let (ep, _adv, shutdown, h) = run_server(Endpoint::Unix(sock.clone()), Encoding::MsgPack);
    assert_eq!(ep, Endpoint::Unix(sock));

    let mut c = AdviceClient::connect(&ep, Encoding::MsgPack).unwrap();
    assert_eq!(c.begin(Some("u.ll"), vec![0.0; N]).unwrap().action, 3);
    assert!(c.get_advice(&observe(true)).unwrap().is_terminal());

    drop(c);
    shutdown.store(true, Ordering::Relaxed);
    h.join().unwrap();
}
