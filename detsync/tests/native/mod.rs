/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The pass-through runtime.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use detsync::types::InsId;
use detsync::Config;
use detsync::Runtime;
use nix::errno::Errno;
use pretty_assertions::assert_eq;

const INS: InsId = InsId::new(5);
const M: usize = 0x10;
const B: usize = 0x20;

fn native() -> Runtime {
    let cfg = Config {
        deterministic: false,
        ..Config::default()
    };
    Runtime::prog_begin(cfg).unwrap()
}

#[test]
fn mutual_exclusion_without_turns() {
    let rt = native();
    assert!(!rt.is_deterministic());
    let counter = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let rt2 = rt.clone();
            let counter = counter.clone();
            rt.spawn(INS, move || {
                for _ in 0..100 {
                    rt2.mutex_lock(INS, M).unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    rt2.mutex_unlock(INS, M).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        assert!(w.tid().is_none());
        w.join(INS).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 400);
    assert!(rt.records().is_empty());
    assert_eq!(rt.prog_end().unwrap().turns, 0);
}

#[test]
fn same_error_contract() {
    let rt = native();
    rt.mutex_lock(INS, M).unwrap();
    assert_eq!(rt.mutex_lock(INS, M), Err(Errno::EDEADLK));
    assert_eq!(rt.mutex_destroy(INS, M), Err(Errno::EBUSY));
    assert_eq!(rt.barrier_init(INS, B, 0), Err(Errno::EINVAL));
    assert_eq!(rt.lineup_init(INS, 1, 0, 5), Err(Errno::EINVAL));
    rt.barrier_init(INS, B, 2).unwrap();
    let rt2 = rt.clone();
    let other = rt.spawn(INS, move || rt2.barrier_wait(INS, B).unwrap());
    let mine = rt.barrier_wait(INS, B).unwrap();
    let theirs = other.join(INS).unwrap();
    assert_ne!(mine, theirs);
}
