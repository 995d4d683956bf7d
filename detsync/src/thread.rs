/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thread creation, exit, join and fork under the turn.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use nix::unistd::ForkResult;
use tracing::debug;
use tracing::error;

use crate::runtime::DetRuntime;
use crate::types::Channel;
use crate::types::DetTid;
use crate::types::InsId;
use crate::types::Phase;
use crate::types::SyncOp;

/// Handle to a thread spawned through a runtime.
#[derive(Debug)]
pub struct JoinHandle<T> {
    inner: thread::JoinHandle<T>,
    det: Option<(Arc<DetRuntime>, DetTid)>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn native(inner: thread::JoinHandle<T>) -> Self {
        JoinHandle { inner, det: None }
    }

    /// The child's internal id, under deterministic scheduling.
    pub fn tid(&self) -> Option<DetTid> {
        self.det.as_ref().map(|(_, tid)| *tid)
    }

    /// threadJoin: wait for the child to exit and reclaim it. A panic in the
    /// child is returned as the error.
    pub fn join(self, ins: InsId) -> thread::Result<T> {
        match self.det {
            Some((rt, child)) => join(&rt, ins, child, self.inner),
            None => self.inner.join(),
        }
    }
}

/// threadCreate: start `f` on a new OS thread that takes part in turn
/// scheduling from its first instruction.
pub(crate) fn spawn<F, T>(rt: &Arc<DetRuntime>, ins: InsId, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut turn = rt.sched.get_turn(ins);
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    let child_rt = Arc::clone(rt);
    // The child blocks on the scheduler lock until this turn is put.
    let inner = thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || run_child(&child_rt, f))
    });
    let child = turn.state().register_thread(inner.thread().id());
    debug!("{} creates {}", turn.tid(), child);
    turn.commit(SyncOp::ThreadCreate, Phase::Complete, &[child.as_raw() as u64], 0);
    turn.put_turn();
    JoinHandle {
        inner,
        det: Some((Arc::clone(rt), child)),
    }
}

fn run_child<F, T>(rt: &DetRuntime, f: F) -> T
where
    F: FnOnce() -> T,
{
    let call_time = Utc::now();
    let mut guard = rt.sched.lock();
    let tid = guard.registry.begin(thread::current().id());
    let mut turn = rt.sched.get_turn_locked(guard, tid, InsId::RUNTIME, call_time);
    turn.commit(SyncOp::ThreadBegin, Phase::Complete, &[], 0);
    turn.put_turn();

    let result = panic::catch_unwind(AssertUnwindSafe(f));

    let mut turn = rt.sched.get_turn(InsId::RUNTIME);
    turn.state().registry.end(tid);
    turn.broadcast(Channel::thread_exit(tid));
    let ret = if result.is_ok() { 0 } else { 1 };
    turn.commit(SyncOp::ThreadEnd, Phase::Complete, &[], ret);
    turn.end_thread();
    match result {
        Ok(v) => v,
        Err(payload) => panic::resume_unwind(payload),
    }
}

fn join<T>(
    rt: &DetRuntime,
    ins: InsId,
    child: DetTid,
    inner: thread::JoinHandle<T>,
) -> thread::Result<T> {
    let mut turn = rt.sched.get_turn(ins);
    while !turn.state().registry.is_zombie(child) {
        turn.wait(Channel::thread_exit(child), None);
    }
    // The child has given up the turn for good; only its unwinding is left.
    let result = inner.join();
    let st = turn.state();
    st.registry.reap(child);
    st.turns.destroy(child);
    turn.commit(SyncOp::ThreadJoin, Phase::Complete, &[child.as_raw() as u64], 0);
    turn.put_turn();
    result
}

/// Fork the process under the turn. The child continues as the only thread of
/// a fresh schedule.
///
/// # Safety
///
/// Same contract as [`nix::unistd::fork`]: the child may only use
/// async-signal-safe functions until it execs, as far as other threads' state
/// is concerned.
pub(crate) unsafe fn fork(rt: &DetRuntime, ins: InsId) -> nix::Result<ForkResult> {
    let mut turn = rt.sched.get_turn(ins);
    // Both images would otherwise write out whatever is still buffered.
    if let Err(e) = turn.state().log.flush() {
        error!("Flushing the turn log before fork failed: {:#}", e);
    }
    let res = nix::unistd::fork();
    match &res {
        Ok(ForkResult::Child) => {
            turn.adopt_forked_process();
            turn.commit(SyncOp::Fork, Phase::Complete, &[0], 0);
        }
        Ok(ForkResult::Parent { child }) => {
            turn.commit(SyncOp::Fork, Phase::Complete, &[child.as_raw() as u64], 0);
        }
        Err(e) => {
            turn.commit(SyncOp::Fork, Phase::Complete, &[], *e as i32);
        }
    }
    turn.put_turn();
    res
}
