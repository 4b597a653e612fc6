//! End-to-end behaviour of the thread-emulated backend.

use mpcomm::{
    Context, Error, RequestState, RuntimeConfig, Status, ThreadRuntime, ANY_SOURCE, ANY_TAG,
};
use rand::{Rng, SeedableRng};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime() -> Arc<ThreadRuntime> {
    init_tracing();
    ThreadRuntime::new(RuntimeConfig::default().with_thread_name_prefix("it"))
}

/// Run `size` ranks and fail the test if they have not all returned in time.
fn run_with_watchdog<R, F>(rt: &Arc<ThreadRuntime>, size: usize, limit: Duration, body: F) -> Vec<R>
where
    F: Fn(Context) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let group = rt.spawn(size, body).unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(group.join());
    });
    match rx.recv_timeout(limit) {
        Ok(results) => results.unwrap(),
        Err(_) => panic!("ranks made no progress within {limit:?}"),
    }
}

#[test]
fn round_trip_between_every_pair() {
    const N: i32 = 4;
    let rt = runtime();
    rt.run(N as usize, |ctx| {
        let me = ctx.rank();
        for a in 0..N {
            for b in (0..N).filter(|&b| b != a) {
                let tag = a * N + b;
                let payload: Vec<f64> = (0..5).map(|k| f64::from(a * 100 + b * 10 + k)).collect();
                if me == a {
                    ctx.send(&payload, b, tag).unwrap();
                } else if me == b {
                    let mut got = vec![0.0f64; 5];
                    let status = ctx.recv(&mut got, a, tag).unwrap();
                    assert_eq!(status, Status { source: a, tag, count: 5 });
                    assert_eq!(got, payload);
                }
            }
        }
    })
    .unwrap();
}

#[test]
fn four_rank_ring_with_tag_seven() {
    let rt = runtime();
    let got = rt
        .run(4, |ctx| {
            let i = ctx.rank();
            let mut incoming = [0i32];
            let mut recv = ctx.irecv(&mut incoming, ANY_SOURCE, 7).unwrap();
            ctx.send(&[i], (i + 1) % 4, 7).unwrap();
            let status = recv.wait().unwrap().unwrap();
            drop(recv);
            assert_eq!(status.source, (i + 3) % 4);
            incoming[0]
        })
        .unwrap();
    assert_eq!(got, vec![3, 0, 1, 2]);
}

#[test]
fn allsum_of_ranks() {
    let rt = runtime();
    for n in 1..=6usize {
        let sums = rt.run(n, |ctx| ctx.allsum(ctx.rank() as u64).unwrap()).unwrap();
        let expected = (n * (n - 1) / 2) as u64;
        assert!(sums.iter().all(|&s| s == expected), "n = {n}: {sums:?}");
    }
}

#[test]
fn allmin_and_allmax() {
    let rt = runtime();
    let got = rt
        .run(5, |ctx| {
            let v = f64::from(ctx.rank()) * 1.5 - 2.0;
            (ctx.allmin(v).unwrap(), ctx.allmax(v).unwrap())
        })
        .unwrap();
    assert!(got.iter().all(|&(lo, hi)| lo == -2.0 && hi == 4.0));
}

#[test]
fn test_is_idempotent_once_true() {
    let rt = runtime();
    rt.run(2, |ctx| {
        if ctx.rank() == 0 {
            ctx.send(&[11u32, 12], 1, 2).unwrap();
        } else {
            let mut buf = [0u32; 4];
            let mut recv = ctx.irecv(&mut buf, 0, 2).unwrap();
            while !recv.test().unwrap() {
                thread::yield_now();
            }
            let first = recv.status();
            for _ in 0..5 {
                assert!(recv.test().unwrap());
                assert_eq!(recv.status(), first);
            }
            assert_eq!(first, Some(Status { source: 0, tag: 2, count: 2 }));
        }
    })
    .unwrap();
}

#[test]
fn cancel_before_start_is_a_no_op() {
    let rt = runtime();
    rt.run(2, |ctx| {
        if ctx.rank() == 0 {
            let mut buf = [0u8; 3];
            let mut req = ctx.request(&mut buf[..], 1, 4).unwrap();
            req.cancel();
            req.cancel();
            assert_eq!(req.state(), RequestState::Created);
            assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
            assert!(req.cancel_handle().is_none());

            req.start().unwrap();
            req.wait().unwrap();
            drop(req);
            assert_eq!(buf, [1, 2, 3]);
        } else {
            ctx.send(&[1u8, 2, 3], 0, 4).unwrap();
        }
    })
    .unwrap();
}

#[test]
fn cancel_of_a_pending_request() {
    let rt = runtime();
    rt.run(2, |ctx| {
        if ctx.rank() == 0 {
            let mut buf = [0i64; 2];
            let mut recv = ctx.irecv(&mut buf, 1, 40).unwrap();
            let data = [5i64];
            let mut send = ctx.isend(&data, 1, 41).unwrap();

            recv.cancel();
            send.cancel();
            assert!(recv.is_cancelled());
            assert!(send.is_cancelled());
            assert_eq!(recv.wait().unwrap(), None);
            assert!(recv.test().unwrap());
            assert_eq!(recv.status(), None);
        }
        ctx.barrier().unwrap();
        if ctx.rank() == 1 {
            assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
        }
    })
    .unwrap();
}

#[test]
fn cancel_after_match_completes_normally() {
    let rt = runtime();
    rt.run(2, |ctx| {
        if ctx.rank() == 0 {
            let mut buf = [0u32; 1];
            let mut recv = ctx.irecv(&mut buf, 1, 0).unwrap();
            ctx.barrier().unwrap();
            recv.cancel();
            assert!(!recv.is_cancelled());
            let status = recv.wait().unwrap().unwrap();
            assert_eq!(status.source, 1);
            assert_eq!(recv.state(), RequestState::Completed);
            drop(recv);
            assert_eq!(buf, [77]);
        } else {
            ctx.send(&[77u32], 0, 0).unwrap();
            ctx.barrier().unwrap();
        }
    })
    .unwrap();
}

#[test]
fn cancel_handle_wakes_a_blocked_waiter() {
    let rt = ThreadRuntime::new(RuntimeConfig::default().with_spin_count(0));
    rt.run(1, |ctx| {
        let mut buf = [0.0f32; 4];
        let mut recv = ctx.irecv(&mut buf, 0, 123).unwrap();
        let handle = recv.cancel_handle().expect("pending request");
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.cancel()
        });
        assert_eq!(recv.wait().unwrap(), None);
        assert!(recv.is_cancelled());
        assert!(canceller.join().unwrap());
        assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
    })
    .unwrap();
}

#[test]
fn same_pair_same_tag_is_fifo() {
    const COUNT: usize = 50;
    let rt = runtime();
    rt.run(2, |ctx| {
        if ctx.rank() == 0 {
            let values: Vec<[u64; 1]> = (0..COUNT as u64).map(|v| [v]).collect();
            let mut list = ctx.new_request_list();
            for v in &values {
                list.add_send(&v[..], 1, 3).unwrap();
            }
            list.start_all().unwrap();
            list.wait_all().unwrap();
        } else {
            thread::sleep(Duration::from_millis(10));
            for expected in 0..COUNT as u64 {
                let mut got = [u64::MAX];
                ctx.recv(&mut got, 0, 3).unwrap();
                assert_eq!(got[0], expected);
            }
        }
    })
    .unwrap();
}

#[test]
fn wildcards_report_the_actual_envelope() {
    let rt = runtime();
    rt.run(5, |ctx| {
        let me = ctx.rank();
        if me == 0 {
            let mut seen = Vec::new();
            for _ in 1..ctx.size() {
                let mut got = [0i32];
                let status = ctx.recv(&mut got, ANY_SOURCE, ANY_TAG).unwrap();
                assert_eq!(status.source, got[0]);
                assert_eq!(status.tag, got[0] + 100);
                seen.push(status.source);
            }
            seen.sort_unstable();
            assert_eq!(seen, vec![1, 2, 3, 4]);
        } else {
            ctx.send(&[me], 0, me + 100).unwrap();
        }
    })
    .unwrap();
}

#[test]
fn invalid_ranks_fail_before_transport() {
    let rt = runtime();
    rt.run(3, |ctx| {
        let err = ctx.send(&[1u8], 3, 0).unwrap_err();
        assert_eq!(err.to_string(), "send: invalid rank 3 (communicator size 3)");
        let mut out = [0u8];
        assert!(matches!(ctx.irecv(&mut out, 9, 0), Err(Error::InvalidRank { rank: 9, .. })));
        assert!(matches!(
            ctx.new_request_list().add_send(&[1u8][..], -4, 0),
            Err(Error::InvalidRank { op: "isend", .. })
        ));
        assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
    })
    .unwrap();
}

#[test]
fn oversized_message_is_reported_to_the_receiver() {
    let rt = runtime();
    let results = rt
        .run(2, |ctx| {
            if ctx.rank() == 0 {
                ctx.send(&[1i32, 2, 3], 1, 0).map(|_| None)
            } else {
                let mut small = [0i32; 2];
                ctx.recv(&mut small, 0, 0).map(Some)
            }
        })
        .unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(Error::Truncated { source_rank: 0, incoming: 3, capacity: 2, .. })
    ));
}

#[test]
fn mismatched_element_kinds_are_reported() {
    let rt = runtime();
    let results = rt
        .run(2, |ctx| {
            if ctx.rank() == 0 {
                ctx.send(&[1.0f64], 1, 0).map(|_| ())
            } else {
                let mut wrong = [0i64; 1];
                ctx.recv(&mut wrong, 0, 0).map(|_| ())
            }
        })
        .unwrap();
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(Error::DatatypeMismatch { .. })));
}

#[test]
fn count_mismatch_is_caught_before_sending() {
    let rt = runtime();
    rt.run(2, |ctx| {
        let data = [0u32; 4];
        assert!(matches!(
            ctx.send_n(&data, 3, 1 - ctx.rank(), 0),
            Err(Error::CountMismatch { declared: 3, actual: 4, .. })
        ));
        assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
    })
    .unwrap();
}

#[test]
fn allreduce_disagreement_panics_every_rank() {
    let rt = runtime();
    let err = rt
        .run(3, |ctx| {
            let len = if ctx.rank() == 1 { 2 } else { 1 };
            let send = vec![1i32; len];
            let mut recv = vec![0i32; len];
            let _ = ctx.allsum_slice(&send, &mut recv);
        })
        .unwrap_err();
    match err {
        Error::RankPanicked { rank, message } => {
            assert_eq!(rank, 0);
            assert!(message.contains("protocol violation"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rt.live_count(), 0);
}

#[test]
fn heavy_traffic_makes_progress() {
    const N: usize = 8;
    const ROUNDS: usize = 25;
    let rt = ThreadRuntime::new(RuntimeConfig::default().with_spin_count(0));
    let totals = run_with_watchdog(&rt, N, Duration::from_secs(60), |ctx| {
        let me = ctx.rank();
        let n = ctx.size();
        let mut rng = rand::rngs::StdRng::seed_from_u64(me as u64);
        let mut checksum = 0u64;
        for round in 0..ROUNDS {
            let len = rng.gen_range(0..64usize);
            let outgoing: Vec<u64> = (0..len).map(|k| (me as u64) << 32 | k as u64).collect();
            let mut incoming: Vec<Vec<u64>> = (0..n).map(|_| vec![0u64; 64]).collect();

            let mut list = ctx.new_request_list();
            for (peer, slot) in incoming.iter_mut().enumerate() {
                list.add_recv(&mut slot[..], peer as i32, round as i32).unwrap();
            }
            for peer in 0..n {
                list.add_send(&outgoing[..], peer, round as i32).unwrap();
            }
            list.start_all().unwrap();
            let statuses = list.wait_all().unwrap().to_vec();
            drop(list);

            for (peer, status) in statuses.iter().take(n as usize).enumerate() {
                let status = status.expect("receive status");
                assert_eq!(status.source, peer as i32);
                for value in &incoming[peer][..status.count as usize] {
                    assert_eq!(value >> 32, peer as u64);
                    checksum += 1;
                }
            }
            if round % 5 == 0 {
                ctx.barrier().unwrap();
            }
        }
        ctx.allsum(checksum).unwrap()
    });
    assert!(totals.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn ranks_are_threads_registered_with_the_runtime() {
    let rt = runtime();
    let observer = Arc::clone(&rt);
    let group = rt
        .spawn(3, move |ctx| {
            let (group, rank) = observer.current_rank().unwrap();
            assert_eq!(rank, ctx.rank());
            assert_eq!(Some(group), ctx.as_thread().map(|t| t.group_id()));
            thread::current().name().unwrap().to_string()
        })
        .unwrap();
    let id = group.id();
    let names = group.join().unwrap();
    assert_eq!(names, vec![format!("it-{id}-0"), format!("it-{id}-1"), format!("it-{id}-2")]);
    assert_eq!(rt.live_count(), 0);
    assert_eq!(rt.zombie_count(), 0);
}
