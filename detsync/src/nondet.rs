/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Non-deterministic regions.
//!
//! Entering and leaving a region each take a turn. In between, the thread is
//! stopped as far as the scheduler is concerned, and its primitive operations
//! run natively against the shared primitive state.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::debug;

use crate::runtime::DetRuntime;
use crate::types::DetTid;
use crate::types::InsId;
use crate::types::Phase;
use crate::types::SyncOp;

/// Threads inside a region, and how many regions were entered and left.
#[derive(Debug, Default)]
pub struct NonDetState {
    inside: BTreeSet<DetTid>,
    pub entered: u64,
    pub exited: u64,
}

impl NonDetState {
    pub fn contains(&self, tid: DetTid) -> bool {
        self.inside.contains(&tid)
    }

    /// Is any thread inside a region?
    pub fn is_empty(&self) -> bool {
        self.inside.is_empty()
    }

    pub fn clear(&mut self) {
        self.inside.clear();
    }

    fn insert(&mut self, tid: DetTid) {
        self.inside.insert(tid);
        self.entered += 1;
    }

    fn remove(&mut self, tid: DetTid) {
        if !self.inside.remove(&tid) {
            panic!(
                "Invariant violation! {} left a non-det region it never entered",
                tid
            );
        }
        self.exited += 1;
    }
}

pub(crate) fn enter(rt: &DetRuntime, ins: InsId) {
    let mut turn = rt.sched.get_turn(ins);
    let tid = turn.tid();
    turn.commit(SyncOp::NonDetStart, Phase::Complete, &[], 0);
    let st = turn.state();
    st.nondet.insert(tid);
    st.tally(|s| s.nondet_regions += 1);
    debug!("{} enters a non-det region", tid);
    turn.stop();
}

/// Leave the region and rejoin the run queue, logging `op` with `args`.
pub(crate) fn exit(rt: &DetRuntime, ins: InsId, op: SyncOp, args: &[u64]) {
    let call_time = Utc::now();
    let mut guard = rt.sched.lock();
    let tid = guard.current();
    guard.nondet.remove(tid);
    debug!("{} leaves a non-det region", tid);
    let mut turn = rt.sched.rejoin_locked(guard, tid, ins, call_time);
    turn.commit(op, Phase::Complete, args, 0);
    turn.put_turn();
}
