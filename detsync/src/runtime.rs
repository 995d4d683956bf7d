/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The deterministic runtime: the hook surface implemented on top of the
//! turn scheduler.

use std::path::Path;
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use detsync_model::Config;
use detsync_model::RunSummary;
use detsync_model::RuntimeStats;
use tracing::debug;
use tracing::info;

use crate::hooks::SyncHooks;
use crate::native::drive_native;
use crate::native::NativeHost;
use crate::scheduler::SchedState;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::sync::barrier::BarrierWaitResult;
use crate::sync::OpCtx;
use crate::sync::SyncTables;
use crate::turn_log::TurnLog;
use crate::types::ret_code;
use crate::types::Channel;
use crate::types::ExternalOp;
use crate::types::HookResult;
use crate::types::InsId;
use crate::types::Phase;
use crate::types::SyncOp;
use crate::types::TurnRecord;
use crate::types::WaitStatus;

impl NativeHost for SchedState {
    fn tables(&mut self) -> &mut SyncTables {
        &mut self.tables
    }

    fn wake_parked(&mut self, wakes: &[(Channel, bool)]) {
        for (chan, all) in wakes {
            self.turns.wake_outside(*chan, *all);
        }
    }
}

/// Runtime that serializes every synchronization operation through the turn.
#[derive(Debug)]
pub struct DetRuntime {
    pub(crate) sched: Scheduler,
    cfg: Config,
}

impl DetRuntime {
    /// progBegin: set up the scheduler with the calling thread as the main
    /// thread.
    pub fn new(cfg: Config) -> anyhow::Result<Arc<Self>> {
        let log = TurnLog::open(&cfg)?;
        let mut state = SchedState::new(&cfg, log);
        let me = thread::current().id();
        let main = state.register_thread(me);
        state.registry.begin(me);
        let rt = Arc::new(DetRuntime {
            sched: Scheduler::new(state),
            cfg,
        });
        let mut turn = rt.sched.get_turn(InsId::RUNTIME);
        turn.commit(SyncOp::ThreadBegin, Phase::Complete, &[], 0);
        turn.put_turn();
        info!(
            "Program begins under deterministic scheduling, main thread {}",
            main
        );
        Ok(rt)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// progEnd: the main thread exits. Flushes the turn log and reports what
    /// the run did.
    pub fn prog_end(&self) -> anyhow::Result<RunSummary> {
        let mut turn = self.sched.get_turn(InsId::RUNTIME);
        let tid = turn.tid();
        turn.commit(SyncOp::ThreadEnd, Phase::Complete, &[], 0);
        let st = turn.state();
        st.registry.end(tid);
        let flushed = st.log.flush();
        let summary = RunSummary {
            turns: st.turns.turn(),
            threads: st.registry.total_registered(),
            nondet_entered: st.nondet.entered,
            nondet_exited: st.nondet.exited,
            log_path: st.log.path().map(Path::to_path_buf),
            stats: st.records_stats().then(|| st.stats.clone()),
        };
        turn.end_thread();
        flushed?;
        info!("Program ends: {}", summary);
        Ok(summary)
    }

    /// Turn log records kept in memory so far.
    pub fn records(&self) -> Vec<TurnRecord> {
        self.sched.lock().log.records()
    }

    pub fn stats(&self) -> RuntimeStats {
        self.sched.lock().stats.clone()
    }

    /// The next turn to be handed out.
    pub fn turn_count(&self) -> u64 {
        self.sched.lock().turns.turn()
    }

    /// Threads parked on a channel, waiting to be signaled or to time out.
    pub fn parked_threads(&self) -> usize {
        self.sched.lock().turns.waiters().len()
    }

    /// Drive one primitive operation: under the turn, or natively inside a
    /// non-deterministic region or a lineup block.
    pub(crate) fn sync_op<R>(
        &self,
        ins: InsId,
        op: SyncOp,
        args: &[u64],
        timeout: Option<Duration>,
        mut step: impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<R>>,
    ) -> HookResult<R> {
        let call_time = Utc::now();
        let mut guard = self.sched.lock();
        let tid = guard.current();
        if guard.runs_freely(tid) {
            if guard.nondet.contains(tid) {
                guard.tally(|s| s.nondet_sync_ops += 1);
            }
            let (_guard, res) = drive_native(
                guard,
                &self.sched.native,
                timeout,
                step,
                |st: &SchedState| self.sched.kick(&st.turns),
            );
            return res;
        }

        let mut turn = self.sched.get_turn_locked(guard, tid, ins, call_time);
        let deadline = timeout.map(|t| {
            let turns = turn.state().timeout_turns(t);
            turn.turn_count() + turns
        });
        let me = thread::current().id();
        let mut timed_out = false;
        loop {
            let (res, fx) = {
                let mut ctx = OpCtx::new(&mut turn.state().tables, me, timed_out);
                let res = step(&mut ctx);
                (res, ctx.into_effects())
            };
            for (chan, all) in fx.wakes {
                if all {
                    turn.broadcast(chan);
                } else {
                    turn.signal(chan);
                }
            }
            if fx.partial {
                turn.commit(op, Phase::Partial, args, 0);
            }
            if fx.yield_turn {
                turn.yield_turn();
            }
            match res {
                Poll::Ready(res) => {
                    turn.state().tally(|s| s.det_sync_ops += 1);
                    turn.commit(op, Phase::Complete, args, ret_code(&res));
                    turn.put_turn();
                    return res;
                }
                Poll::Pending => {
                    let (chan, timed) = match fx.blocked_on {
                        Some(b) => b,
                        None => panic!(
                            "Invariant violation! {} pending without a channel to wait on",
                            op
                        ),
                    };
                    let status = turn.wait(chan, if timed { deadline } else { None });
                    timed_out = status == WaitStatus::TimedOut;
                }
            }
        }
    }

    /// Run `f` holding the turn and log it as one turn. A thread running
    /// freely just runs `f`.
    fn counted<R>(
        &self,
        ins: InsId,
        op: SyncOp,
        args: &[u64],
        f: impl FnOnce(&mut SchedState) -> HookResult<R>,
    ) -> HookResult<R> {
        let call_time = Utc::now();
        let mut guard = self.sched.lock();
        let tid = guard.current();
        if guard.runs_freely(tid) {
            return f(&mut guard);
        }
        let mut turn = self.sched.get_turn_locked(guard, tid, ins, call_time);
        let res = f(turn.state());
        turn.commit(op, Phase::Complete, args, ret_code(&res));
        turn.put_turn();
        res
    }

    /// block: give up the turn to wait on something outside scheduler control.
    /// Returns the turn at which the thread left. Must be followed by
    /// [`DetRuntime::wakeup`] on the same thread.
    pub fn block(&self, ins: InsId) -> u64 {
        let turn = self.sched.get_turn(ins);
        let at = turn.turn_count();
        debug!("[turn {}] {} blocks", at, turn.tid());
        turn.stop();
        at
    }

    /// wakeup: rejoin the run queue after [`DetRuntime::block`], and log the
    /// completed external operation.
    pub fn wakeup(&self, ins: InsId, op: ExternalOp, blocked_at: u64) {
        let call_time = Utc::now();
        let guard = self.sched.lock();
        let tid = guard.current();
        let mut turn = self.sched.rejoin_locked(guard, tid, ins, call_time);
        turn.state().tally(|s| s.external_ops += 1);
        turn.commit(SyncOp::External(op), Phase::Complete, &[blocked_at], 0);
        turn.put_turn();
    }

    fn runs_freely(&self) -> bool {
        let guard = self.sched.lock();
        let tid = guard.current();
        guard.runs_freely(tid)
    }

    /// Run `f` between block and wakeup. Outside turn discipline it is a
    /// plain call.
    pub fn external<R>(&self, ins: InsId, op: ExternalOp, f: impl FnOnce() -> R) -> R {
        if self.runs_freely() {
            return f();
        }
        let at = self.block(ins);
        let r = f();
        self.wakeup(ins, op, at);
        r
    }
}

fn a(addr: usize) -> u64 {
    addr as u64
}

impl SyncHooks for DetRuntime {
    fn mutex_init(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::MutexInit, &[a(addr)], None, sync::mutex::init(addr))
    }

    fn mutex_lock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::MutexLock, &[a(addr)], None, sync::mutex::lock(addr, false))
    }

    fn mutex_trylock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::MutexTryLock, &[a(addr)], None, sync::mutex::trylock(addr))
    }

    fn mutex_timedlock(&self, ins: InsId, addr: usize, timeout: Duration) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::MutexTimedLock,
            &[a(addr)],
            Some(timeout),
            sync::mutex::lock(addr, true),
        )
    }

    fn mutex_unlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::MutexUnlock, &[a(addr)], None, sync::mutex::unlock(addr))
    }

    fn mutex_destroy(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::MutexDestroy, &[a(addr)], None, sync::mutex::destroy(addr))
    }

    fn cond_init(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::CondInit, &[a(addr)], None, sync::cond::init(addr))
    }

    fn cond_wait(&self, ins: InsId, cond: usize, mutex: usize) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::CondWait,
            &[a(cond), a(mutex)],
            None,
            sync::cond::wait(cond, mutex, false),
        )
    }

    fn cond_timedwait(
        &self,
        ins: InsId,
        cond: usize,
        mutex: usize,
        timeout: Duration,
    ) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::CondTimedWait,
            &[a(cond), a(mutex)],
            Some(timeout),
            sync::cond::wait(cond, mutex, true),
        )
    }

    fn cond_signal(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::CondSignal, &[a(addr)], None, sync::cond::signal(addr))
    }

    fn cond_broadcast(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::CondBroadcast, &[a(addr)], None, sync::cond::broadcast(addr))
    }

    fn cond_destroy(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::CondDestroy, &[a(addr)], None, sync::cond::destroy(addr))
    }

    fn barrier_init(&self, ins: InsId, addr: usize, count: u32) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::BarrierInit,
            &[a(addr), count as u64],
            None,
            sync::barrier::init(addr, count),
        )
    }

    fn barrier_wait(&self, ins: InsId, addr: usize) -> HookResult<BarrierWaitResult> {
        self.sync_op(ins, SyncOp::BarrierWait, &[a(addr)], None, sync::barrier::wait(addr))
    }

    fn barrier_destroy(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::BarrierDestroy, &[a(addr)], None, sync::barrier::destroy(addr))
    }

    fn sem_init(&self, ins: InsId, addr: usize, value: u32) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::SemInit,
            &[a(addr), value as u64],
            None,
            sync::sem::init(addr, value),
        )
    }

    fn sem_wait(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::SemWait, &[a(addr)], None, sync::sem::wait(addr, false))
    }

    fn sem_trywait(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::SemTryWait, &[a(addr)], None, sync::sem::trywait(addr))
    }

    fn sem_timedwait(&self, ins: InsId, addr: usize, timeout: Duration) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::SemTimedWait,
            &[a(addr)],
            Some(timeout),
            sync::sem::wait(addr, true),
        )
    }

    fn sem_post(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::SemPost, &[a(addr)], None, sync::sem::post(addr))
    }

    fn sem_getvalue(&self, ins: InsId, addr: usize) -> HookResult<i32> {
        self.sync_op(ins, SyncOp::SemGetValue, &[a(addr)], None, sync::sem::getvalue(addr))
    }

    fn sem_destroy(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::SemDestroy, &[a(addr)], None, sync::sem::destroy(addr))
    }

    fn rwlock_init(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::RwLockInit, &[a(addr)], None, sync::rwlock::init(addr))
    }

    fn rwlock_rdlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::RwLockRdLock,
            &[a(addr)],
            None,
            sync::rwlock::rdlock(addr, false),
        )
    }

    fn rwlock_wrlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::RwLockWrLock,
            &[a(addr)],
            None,
            sync::rwlock::wrlock(addr, false),
        )
    }

    fn rwlock_tryrdlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::RwLockTryRdLock,
            &[a(addr)],
            None,
            sync::rwlock::rdlock(addr, true),
        )
    }

    fn rwlock_trywrlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(
            ins,
            SyncOp::RwLockTryWrLock,
            &[a(addr)],
            None,
            sync::rwlock::wrlock(addr, true),
        )
    }

    fn rwlock_unlock(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::RwLockUnlock, &[a(addr)], None, sync::rwlock::unlock(addr))
    }

    fn rwlock_destroy(&self, ins: InsId, addr: usize) -> HookResult<()> {
        self.sync_op(ins, SyncOp::RwLockDestroy, &[a(addr)], None, sync::rwlock::destroy(addr))
    }

    fn sched_yield(&self, ins: InsId) {
        let res: HookResult<()> = self.counted(ins, SyncOp::SchedYield, &[], |_| Ok(()));
        debug_assert!(res.is_ok());
    }

    fn sleep(&self, ins: InsId, duration: Duration) {
        let call_time = Utc::now();
        let mut guard = self.sched.lock();
        let tid = guard.current();
        if guard.runs_freely(tid) {
            drop(guard);
            thread::sleep(duration);
            return;
        }
        let turns = guard.timeout_turns(duration);
        let mut turn = self.sched.get_turn_locked(guard, tid, ins, call_time);
        let deadline = turn.turn_count() + turns;
        let status = turn.wait(Channel::sleep(tid), Some(deadline));
        debug_assert_eq!(status, WaitStatus::TimedOut);
        turn.commit(SyncOp::Sleep, Phase::Complete, &[turns], 0);
        turn.put_turn();
    }

    fn lineup_init(
        &self,
        ins: InsId,
        id: usize,
        count: u32,
        timeout_turns: u64,
    ) -> HookResult<()> {
        self.counted(
            ins,
            SyncOp::LineupInit,
            &[a(id), count as u64, timeout_turns],
            |st| {
                if st.runs_freely(st.current()) {
                    return Ok(());
                }
                crate::lineup::init(st, id, count, timeout_turns)
            },
        )
    }

    fn lineup_start(&self, ins: InsId, id: usize) -> HookResult<()> {
        crate::lineup::start(self, ins, id)
    }

    fn lineup_end(&self, ins: InsId, id: usize) -> HookResult<()> {
        crate::lineup::end(self, ins, id)
    }

    fn lineup_destroy(&self, ins: InsId, id: usize) -> HookResult<()> {
        self.counted(ins, SyncOp::LineupDestroy, &[a(id)], |st| {
            if st.runs_freely(st.current()) {
                return Ok(());
            }
            crate::lineup::destroy(st, id)
        })
    }

    fn nondet_enter(&self, ins: InsId) {
        if self.cfg.enforce_nondet_annotations {
            crate::nondet::enter(self, ins)
        }
    }

    fn nondet_exit(&self, ins: InsId) {
        if self.cfg.enforce_nondet_annotations {
            crate::nondet::exit(self, ins, SyncOp::NonDetEnd, &[])
        }
    }

    fn nondet_barrier_exit(&self, ins: InsId, barrier: usize, count: u32) {
        if self.cfg.enforce_nondet_annotations {
            crate::nondet::exit(
                self,
                ins,
                SyncOp::NonDetBarrierEnd,
                &[a(barrier), count as u64],
            )
        }
    }

    fn external_call(&self, ins: InsId, op: ExternalOp, f: &mut dyn FnMut()) {
        self.external(ins, op, f)
    }
}
