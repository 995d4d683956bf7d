/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The emulated primitives under the turn.

use std::time::Duration;

use detsync::types::InsId;
use detsync::types::Phase;
use detsync::types::SyncOp;
use detsync::types::TurnRecord;
use detsync::BarrierWaitResult;
use detsync::Config;
use detsync_testutils::det_test_fn;
use detsync_testutils::ops;
use detsync_testutils::run_once;
use detsync_testutils::BOTTOM_CFG;
use detsync_testutils::TOP_CFG;
use nix::errno::Errno;
use pretty_assertions::assert_eq;

const INS: InsId = InsId::new(1);
const M: usize = 0x1000;
const C: usize = 0x2000;
const B: usize = 0x3000;
const S: usize = 0x4000;
const L: usize = 0x5000;

fn completed(records: &[TurnRecord], op: SyncOp) -> Vec<&TurnRecord> {
    records
        .iter()
        .filter(|r| r.op == op && r.phase == Phase::Complete)
        .collect()
}

#[test]
fn two_threads_one_mutex() {
    let out = det_test_fn(&BOTTOM_CFG, |rt| {
        rt.mutex_init(INS, M).unwrap();
        rt.mutex_lock(INS, M).unwrap();
        let rt2 = rt.clone();
        let child = rt.spawn(INS, move || {
            rt2.mutex_lock(INS, M).unwrap();
            rt2.mutex_unlock(INS, M).unwrap();
        });
        // Let the child run into the locked mutex.
        rt.sched_yield(INS);
        rt.mutex_unlock(INS, M).unwrap();
        child.join(INS).unwrap();
    });
    let o = |tid: u32, op: &str| (tid, op.to_string());
    assert_eq!(
        ops(&out.records),
        vec![
            o(0, "ThreadBegin"),
            o(0, "MutexInit"),
            o(0, "MutexLock"),
            o(0, "ThreadCreate"),
            o(1, "ThreadBegin"),
            o(0, "SchedYield"),
            o(0, "MutexUnlock"),
            o(1, "MutexLock"),
            o(1, "MutexUnlock"),
            o(1, "ThreadEnd"),
            o(0, "ThreadJoin"),
            o(0, "ThreadEnd"),
        ]
    );
    // The woken waiter locks on the turn right after the unlock.
    let unlock = &out.records[6];
    let relock = &out.records[7];
    assert_eq!(relock.turn, unlock.turn + 1);
    for (ix, r) in out.records.iter().enumerate() {
        assert_eq!(r.turn, ix as u64);
    }
}

#[test]
fn mutex_error_codes() {
    let out = run_once(&BOTTOM_CFG, |rt| {
        rt.mutex_lock(INS, M).unwrap();
        assert_eq!(rt.mutex_lock(INS, M), Err(Errno::EDEADLK));
        assert_eq!(rt.mutex_destroy(INS, M), Err(Errno::EBUSY));
        let rt2 = rt.clone();
        let child = rt.spawn(INS, move || {
            assert_eq!(rt2.mutex_trylock(INS, M), Err(Errno::EBUSY));
            assert_eq!(rt2.mutex_unlock(INS, M), Err(Errno::EPERM));
            rt2.mutex_timedlock(INS, M, Duration::from_millis(10))
        });
        let res = child.join(INS).unwrap();
        assert_eq!(res, Err(Errno::ETIMEDOUT));
        rt.mutex_unlock(INS, M).unwrap();
        rt.mutex_destroy(INS, M).unwrap();
    });
    let timed = completed(&out.records, SyncOp::MutexTimedLock);
    assert_eq!(timed.len(), 1);
    assert_eq!(timed[0].ret, Errno::ETIMEDOUT as i32);
    let lock_errs: Vec<i32> = completed(&out.records, SyncOp::MutexLock)
        .iter()
        .map(|r| r.ret)
        .collect();
    assert_eq!(lock_errs, vec![0, Errno::EDEADLK as i32]);
}

#[test]
fn signal_wakes_waiters_in_parking_order() {
    let out = det_test_fn(&BOTTOM_CFG, |rt| {
        rt.sem_init(INS, S, 0).unwrap();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let rt2 = rt.clone();
                rt.spawn(INS, move || rt2.sem_wait(INS, S).unwrap())
            })
            .collect();
        for _ in 0..4 {
            rt.sched_yield(INS);
        }
        rt.sem_post(INS, S).unwrap();
        rt.sem_post(INS, S).unwrap();
        for w in waiters {
            w.join(INS).unwrap();
        }
    });
    let waits = completed(&out.records, SyncOp::SemWait);
    let posts = completed(&out.records, SyncOp::SemPost);
    assert_eq!(
        waits.iter().map(|r| r.tid.as_raw()).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(waits[0].turn, posts[0].turn + 1);
}

#[test]
fn cond_broadcast_releases_waiters_in_order() {
    let out = det_test_fn(&BOTTOM_CFG, |rt| {
        rt.mutex_init(INS, M).unwrap();
        rt.cond_init(INS, C).unwrap();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let rt2 = rt.clone();
                rt.spawn(INS, move || {
                    rt2.mutex_lock(INS, M).unwrap();
                    rt2.cond_wait(INS, C, M).unwrap();
                    rt2.mutex_unlock(INS, M).unwrap();
                })
            })
            .collect();
        for _ in 0..6 {
            rt.sched_yield(INS);
        }
        rt.cond_broadcast(INS, C).unwrap();
        for w in waiters {
            w.join(INS).unwrap();
        }
        rt.cond_destroy(INS, C).unwrap();
    });
    let firsts: Vec<u32> = out
        .records
        .iter()
        .filter(|r| r.op == SyncOp::CondWait && r.phase == Phase::Partial)
        .map(|r| r.tid.as_raw())
        .collect();
    assert_eq!(firsts, vec![1, 2]);
    let dones: Vec<u32> = completed(&out.records, SyncOp::CondWait)
        .iter()
        .map(|r| r.tid.as_raw())
        .collect();
    assert_eq!(dones, vec![1, 2]);
}

#[test]
fn cond_wait_requires_the_mutex() {
    run_once(&BOTTOM_CFG, |rt| {
        assert_eq!(rt.cond_wait(INS, C, M), Err(Errno::EPERM));
        rt.mutex_lock(INS, M).unwrap();
        assert_eq!(
            rt.cond_timedwait(INS, C, M, Duration::from_millis(3)),
            Err(Errno::ETIMEDOUT)
        );
        // Held again after the timeout.
        assert_eq!(rt.mutex_lock(INS, M), Err(Errno::EDEADLK));
        rt.mutex_unlock(INS, M).unwrap();
    });
}

#[test]
fn barrier_of_three() {
    let out = det_test_fn(&BOTTOM_CFG, |rt| {
        rt.barrier_init(INS, B, 3).unwrap();
        let children: Vec<_> = (0..2)
            .map(|_| {
                let rt2 = rt.clone();
                rt.spawn(INS, move || {
                    let a = rt2.barrier_wait(INS, B).unwrap();
                    let b = rt2.barrier_wait(INS, B).unwrap();
                    (a, b)
                })
            })
            .collect();
        let mine = (rt.barrier_wait(INS, B).unwrap(), rt.barrier_wait(INS, B).unwrap());
        let mut results = vec![mine];
        for c in children {
            results.push(c.join(INS).unwrap());
        }
        for round in [0, 1] {
            let serial = results
                .iter()
                .map(|r| if round == 0 { r.0 } else { r.1 })
                .filter(|r| *r == BarrierWaitResult::Serial)
                .count();
            assert_eq!(serial, 1);
        }
        rt.barrier_destroy(INS, B).unwrap();
    });
    let waits = completed(&out.records, SyncOp::BarrierWait);
    assert_eq!(waits.len(), 6);
    for round in waits.chunks(3) {
        assert_eq!(round[1].turn, round[0].turn + 1);
        assert_eq!(round[2].turn, round[1].turn + 1);
    }
}

#[test]
fn barrier_errors() {
    run_once(&BOTTOM_CFG, |rt| {
        assert_eq!(rt.barrier_init(INS, B, 0), Err(Errno::EINVAL));
        assert_eq!(rt.barrier_wait(INS, B), Err(Errno::EINVAL));
        assert_eq!(rt.barrier_destroy(INS, B), Err(Errno::EINVAL));
        rt.barrier_init(INS, B, 1).unwrap();
        assert_eq!(rt.barrier_wait(INS, B), Ok(BarrierWaitResult::Serial));
    });
}

#[test]
fn semaphore_operations() {
    let out = run_once(&BOTTOM_CFG, |rt| {
        rt.sem_init(INS, S, 1).unwrap();
        rt.sem_trywait(INS, S).unwrap();
        assert_eq!(rt.sem_trywait(INS, S), Err(Errno::EAGAIN));
        assert_eq!(
            rt.sem_timedwait(INS, S, Duration::from_millis(10)),
            Err(Errno::ETIMEDOUT)
        );
        rt.sem_post(INS, S).unwrap();
        assert_eq!(rt.sem_getvalue(INS, S), Ok(1));
        rt.sem_destroy(INS, S).unwrap();
        assert_eq!(rt.sem_post(INS, S), Err(Errno::EINVAL));
    });
    // Nobody else can run, so the counter skips ahead to the deadline: ten
    // turns of one millisecond.
    let timed = completed(&out.records, SyncOp::SemTimedWait)[0];
    let before = completed(&out.records, SyncOp::SemTryWait)[1];
    assert!(timed.turn > before.turn + 10);
}

#[test]
fn rwlock_readers_and_writers() {
    let out = det_test_fn(&BOTTOM_CFG, |rt| {
        rt.rwlock_init(INS, L).unwrap();
        rt.rwlock_rdlock(INS, L).unwrap();
        let rt2 = rt.clone();
        let reader = rt.spawn(INS, move || {
            rt2.rwlock_rdlock(INS, L).unwrap();
            assert_eq!(rt2.rwlock_trywrlock(INS, L), Err(Errno::EBUSY));
            rt2.rwlock_unlock(INS, L).unwrap();
        });
        reader.join(INS).unwrap();
        let rt3 = rt.clone();
        let writer = rt.spawn(INS, move || {
            rt3.rwlock_wrlock(INS, L).unwrap();
            rt3.rwlock_unlock(INS, L).unwrap();
        });
        rt.sched_yield(INS);
        rt.sched_yield(INS);
        rt.rwlock_unlock(INS, L).unwrap();
        writer.join(INS).unwrap();
        assert_eq!(rt.rwlock_unlock(INS, L), Err(Errno::EPERM));
        rt.rwlock_destroy(INS, L).unwrap();
    });
    let wr = completed(&out.records, SyncOp::RwLockWrLock)[0];
    let unlocks = completed(&out.records, SyncOp::RwLockUnlock);
    // The writer only gets in once the main thread's read hold is gone.
    let main_unlock = unlocks
        .iter()
        .find(|r| r.tid.as_raw() == 0 && r.ret == 0)
        .unwrap();
    assert!(wr.turn > main_unlock.turn);
}

#[test]
fn sleep_and_yield_are_counted() {
    let mut cfg = BOTTOM_CFG.clone();
    cfg.nanos_per_turn = 1_000;
    let out = det_test_fn(&cfg, |rt| {
        rt.sched_yield(INS);
        rt.sleep(INS, Duration::from_micros(50));
    });
    let sleep = completed(&out.records, SyncOp::Sleep)[0];
    assert_eq!(sleep.args, vec![50]);
    let yielded = completed(&out.records, SyncOp::SchedYield)[0];
    assert_eq!(sleep.turn, yielded.turn + 1 + 50 + 1);
}

#[test]
fn random_schedule_is_reproducible() {
    let cfg = Config {
        enforce_nondet_annotations: false,
        ..TOP_CFG.clone()
    };
    det_test_fn(&cfg, |rt| {
        rt.mutex_init(INS, M).unwrap();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let rt2 = rt.clone();
                rt.spawn(INS, move || {
                    for _ in 0..5 {
                        rt2.mutex_lock(INS, M).unwrap();
                        rt2.sched_yield(INS);
                        rt2.mutex_unlock(INS, M).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join(INS).unwrap();
        }
    });
}

#[test]
#[should_panic(expected = "Deadlock")]
fn waiting_alone_is_a_deadlock() {
    run_once(&BOTTOM_CFG, |rt| {
        rt.sem_init(INS, S, 0).unwrap();
        let _ = rt.sem_wait(INS, S);
    });
}
