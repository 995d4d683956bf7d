/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lineups: groups of threads running a block concurrently.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use detsync::types::ExternalOp;
use detsync::types::InsId;
use detsync::types::SyncOp;
use detsync::Config;
use detsync::DetRuntime;
use detsync::Runtime;
use detsync_testutils::det_test_fn;
use detsync_testutils::run_once;
use detsync_testutils::BOTTOM_CFG;
use nix::errno::Errno;
use pretty_assertions::assert_eq;

const INS: InsId = InsId::new(7);
const LINEUP: usize = 0x77;
const M: usize = 0x1000;

fn det(rt: &Runtime) -> Arc<DetRuntime> {
    match rt {
        Runtime::Deterministic(d) => d.clone(),
        Runtime::Native(_) => unreachable!(),
    }
}

fn stats_cfg() -> Config {
    Config {
        record_runtime_stat: true,
        ..BOTTOM_CFG.clone()
    }
}

#[test]
fn group_of_four_times_out_with_three() {
    let out = det_test_fn(&stats_cfg(), |rt| {
        rt.lineup_init(INS, LINEUP, 4, 20).unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let members: Vec<_> = (0..3)
            .map(|_| {
                let rt2 = rt.clone();
                let inside = inside.clone();
                rt.spawn(INS, move || {
                    rt2.lineup_start(INS, LINEUP).unwrap();
                    inside.fetch_add(1, Ordering::SeqCst);
                    rt2.lineup_end(INS, LINEUP).unwrap();
                })
            })
            .collect();
        for m in members {
            m.join(INS).unwrap();
        }
        assert_eq!(inside.load(Ordering::SeqCst), 3);

        // The fourth arrival starts a round of its own.
        rt.lineup_start(INS, LINEUP).unwrap();
        rt.lineup_end(INS, LINEUP).unwrap();
        rt.lineup_destroy(INS, LINEUP).unwrap();
    });

    let starts: Vec<_> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::LineupStart)
        .collect();
    assert_eq!(starts.len(), 4);
    for s in &starts[..3] {
        assert_eq!(s.args, vec![LINEUP as u64, 3]);
    }
    assert_eq!(starts[3].tid.as_raw(), 0);
    assert_eq!(starts[3].args, vec![LINEUP as u64, 1]);

    // The first round's members rejoin in thread id order.
    let ends: Vec<u32> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::LineupEnd)
        .map(|r| r.tid.as_raw())
        .collect();
    assert_eq!(ends, vec![1, 2, 3, 0]);

    let stats = out.summary.stats.expect("stats recorded");
    assert_eq!(stats.lineup_timeout, 2);
    assert_eq!(stats.lineup_success, 0);
}

#[test]
fn full_group_starts_without_waiting() {
    let out = det_test_fn(&stats_cfg(), |rt| {
        rt.lineup_init(INS, LINEUP, 2, 1_000).unwrap();
        let rt2 = rt.clone();
        let other = rt.spawn(INS, move || {
            rt2.lineup_start(INS, LINEUP).unwrap();
            rt2.lineup_end(INS, LINEUP).unwrap();
        });
        rt.lineup_start(INS, LINEUP).unwrap();
        rt.lineup_end(INS, LINEUP).unwrap();
        other.join(INS).unwrap();
    });
    let stats = out.summary.stats.expect("stats recorded");
    assert_eq!(stats.lineup_success, 1);
    assert_eq!(stats.lineup_timeout, 0);
    // Nowhere near the timeout.
    assert!(out.summary.turns < 100);
}

#[test]
fn lineup_errors() {
    run_once(&BOTTOM_CFG, |rt| {
        assert_eq!(rt.lineup_init(INS, LINEUP, 0, 10), Err(Errno::EINVAL));
        assert_eq!(rt.lineup_start(INS, LINEUP), Err(Errno::EINVAL));
        assert_eq!(rt.lineup_end(INS, LINEUP), Err(Errno::EINVAL));
        assert_eq!(rt.lineup_destroy(INS, LINEUP), Err(Errno::EINVAL));
        rt.lineup_init(INS, LINEUP, 2, 10).unwrap();
        assert_eq!(rt.lineup_init(INS, LINEUP, 2, 10), Err(Errno::EBUSY));
        rt.lineup_destroy(INS, LINEUP).unwrap();
    });
}

#[test]
fn members_synchronize_inside_the_block() {
    let out = det_test_fn(&stats_cfg(), |rt| {
        rt.lineup_init(INS, LINEUP, 2, 1_000).unwrap();
        rt.mutex_init(INS, M).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let members: Vec<_> = (0..2)
            .map(|_| {
                let rt2 = rt.clone();
                let counter = counter.clone();
                rt.spawn(INS, move || {
                    rt2.lineup_start(INS, LINEUP).unwrap();
                    for _ in 0..50 {
                        rt2.mutex_lock(INS, M).unwrap();
                        let v = counter.load(Ordering::Relaxed);
                        rt2.sched_yield(INS);
                        counter.store(v + 1, Ordering::Relaxed);
                        rt2.mutex_unlock(INS, M).unwrap();
                    }
                    rt2.sleep(INS, Duration::from_micros(10));
                    rt2.external_call(INS, ExternalOp::Other, &mut || {});
                    rt2.lineup_end(INS, LINEUP).unwrap();
                })
            })
            .collect();
        for m in members {
            m.join(INS).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        // Back under turns after the block.
        rt.mutex_lock(INS, M).unwrap();
        rt.mutex_unlock(INS, M).unwrap();
    });
    let locks: Vec<_> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::MutexLock)
        .collect();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].tid.as_raw(), 0);
    assert!(!out.records.iter().any(|r| r.op == SyncOp::SchedYield
        || r.op == SyncOp::Sleep
        || matches!(r.op, SyncOp::External(_))));
    let stats = out.summary.stats.expect("stats recorded");
    assert_eq!(stats.lineup_success, 1);
    assert_eq!(stats.nondet_sync_ops, 0);
}

#[test]
fn late_arrival_waits_for_the_next_round() {
    let out = det_test_fn(&stats_cfg(), |rt| {
        rt.lineup_init(INS, LINEUP, 3, 20).unwrap();
        let members: Vec<_> = (0..3)
            .map(|_| {
                let rt2 = rt.clone();
                let det = det(rt);
                rt.spawn(INS, move || {
                    rt2.lineup_start(INS, LINEUP).unwrap();
                    // Hold the round open until the main thread waits in
                    // join and the late thread waits in start.
                    while det.parked_threads() < 2 {
                        thread::yield_now();
                    }
                    rt2.lineup_end(INS, LINEUP).unwrap();
                })
            })
            .collect();
        let rt4 = rt.clone();
        let late = rt.spawn(INS, move || {
            assert_eq!(rt4.lineup_destroy(INS, LINEUP), Err(Errno::EBUSY));
            rt4.lineup_start(INS, LINEUP).unwrap();
            rt4.lineup_end(INS, LINEUP).unwrap();
        });
        for m in members {
            m.join(INS).unwrap();
        }
        late.join(INS).unwrap();
        rt.lineup_destroy(INS, LINEUP).unwrap();
    });

    let starts: Vec<_> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::LineupStart)
        .collect();
    assert_eq!(starts.len(), 4);
    let mut first: Vec<u32> = starts[..3].iter().map(|r| r.tid.as_raw()).collect();
    first.sort_unstable();
    assert_eq!(first, vec![1, 2, 3]);
    for s in &starts[..3] {
        assert_eq!(s.args, vec![LINEUP as u64, 3]);
    }
    assert_eq!(starts[3].tid.as_raw(), 4);
    assert_eq!(starts[3].args, vec![LINEUP as u64, 1]);

    let last_end = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::LineupEnd && r.tid.as_raw() != 4)
        .map(|r| r.turn)
        .max()
        .expect("first round ended");
    assert!(starts[3].turn > last_end);

    let destroys: Vec<_> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::LineupDestroy)
        .map(|r| (r.tid.as_raw(), r.ret))
        .collect();
    assert_eq!(destroys, vec![(4, Errno::EBUSY as i32), (0, 0)]);

    let stats = out.summary.stats.expect("stats recorded");
    assert_eq!(stats.lineup_success, 1);
    assert_eq!(stats.lineup_timeout, 1);
}

#[test]
fn destroy_is_refused_while_members_wait() {
    run_once(&BOTTOM_CFG, |rt| {
        rt.lineup_init(INS, LINEUP, 2, 1_000).unwrap();
        let rt2 = rt.clone();
        let other = rt.spawn(INS, move || {
            rt2.lineup_start(INS, LINEUP).unwrap();
            rt2.lineup_end(INS, LINEUP).unwrap();
        });
        // Let the child check in.
        rt.sched_yield(INS);
        rt.sched_yield(INS);
        assert_eq!(rt.lineup_destroy(INS, LINEUP), Err(Errno::EBUSY));
        rt.lineup_start(INS, LINEUP).unwrap();
        rt.lineup_end(INS, LINEUP).unwrap();
        other.join(INS).unwrap();
        rt.lineup_destroy(INS, LINEUP).unwrap();
    });
}
