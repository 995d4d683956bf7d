/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Running primitive steps without turns.
//!
//! [`drive_native`] polls a step under an ordinary lock and sleeps on a
//! condition variable while it is pending. It serves threads inside
//! non-deterministic regions, and the whole of [`NativeRuntime`].

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::task::Poll;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;

use crate::hooks::SyncHooks;
use crate::sync;
use crate::sync::barrier::BarrierWaitResult;
use crate::sync::OpCtx;
use crate::sync::SyncTables;
use crate::types::Channel;
use crate::types::ExternalOp;
use crate::types::HookResult;
use crate::types::InsId;

/// Owner of the primitive tables a native step runs against.
pub(crate) trait NativeHost {
    fn tables(&mut self) -> &mut SyncTables;

    /// Requeue deterministic threads parked on channels a native step
    /// released.
    fn wake_parked(&mut self, _wakes: &[(Channel, bool)]) {}
}

impl NativeHost for SyncTables {
    fn tables(&mut self) -> &mut SyncTables {
        self
    }
}

/// Poll `step` to completion, sleeping on `cv` while it is pending. `timeout`
/// bounds the time spent in waits the step marks as timed. `after_wake` runs
/// whenever the step released someone.
pub(crate) fn drive_native<'a, H, R>(
    mut guard: MutexGuard<'a, H>,
    cv: &Condvar,
    timeout: Option<Duration>,
    mut step: impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<R>>,
    mut after_wake: impl FnMut(&H),
) -> (MutexGuard<'a, H>, HookResult<R>)
where
    H: NativeHost,
{
    let me = thread::current().id();
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;
    loop {
        let (res, fx) = {
            let mut ctx = OpCtx::new(guard.tables(), me, timed_out);
            let res = step(&mut ctx);
            (res, ctx.into_effects())
        };
        if !fx.wakes.is_empty() {
            guard.wake_parked(&fx.wakes);
            after_wake(&guard);
            cv.notify_all();
        }
        if let Poll::Ready(res) = res {
            return (guard, res);
        }
        let timed = match fx.blocked_on {
            Some((_, timed)) => timed,
            None => panic!("Invariant violation! A pending step named no channel to wait on"),
        };
        match deadline.filter(|_| timed) {
            None => {
                guard = cv
                    .wait(guard)
                    .expect("Invariant violation! Native sync state poisoned");
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    timed_out = true;
                    continue;
                }
                guard = cv
                    .wait_timeout(guard, deadline - now)
                    .expect("Invariant violation! Native sync state poisoned")
                    .0;
                timed_out = Instant::now() >= deadline;
            }
        }
    }
}

/// The hook surface with native semantics: same results and error codes, no
/// turns, no log.
#[derive(Debug, Default)]
pub struct NativeRuntime {
    tables: Mutex<SyncTables>,
    cv: Condvar,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn run<R>(
        &self,
        timeout: Option<Duration>,
        step: impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<R>>,
    ) -> HookResult<R> {
        let guard = self
            .tables
            .lock()
            .expect("Invariant violation! Native sync state poisoned");
        drive_native(guard, &self.cv, timeout, step, |_| {}).1
    }
}

impl SyncHooks for NativeRuntime {
    fn mutex_init(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::mutex::init(addr))
    }

    fn mutex_lock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::mutex::lock(addr, false))
    }

    fn mutex_trylock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::mutex::trylock(addr))
    }

    fn mutex_timedlock(&self, _ins: InsId, addr: usize, timeout: Duration) -> HookResult<()> {
        self.run(Some(timeout), sync::mutex::lock(addr, true))
    }

    fn mutex_unlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::mutex::unlock(addr))
    }

    fn mutex_destroy(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::mutex::destroy(addr))
    }

    fn cond_init(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::cond::init(addr))
    }

    fn cond_wait(&self, _ins: InsId, cond: usize, mutex: usize) -> HookResult<()> {
        self.run(None, sync::cond::wait(cond, mutex, false))
    }

    fn cond_timedwait(
        &self,
        _ins: InsId,
        cond: usize,
        mutex: usize,
        timeout: Duration,
    ) -> HookResult<()> {
        self.run(Some(timeout), sync::cond::wait(cond, mutex, true))
    }

    fn cond_signal(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::cond::signal(addr))
    }

    fn cond_broadcast(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::cond::broadcast(addr))
    }

    fn cond_destroy(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::cond::destroy(addr))
    }

    fn barrier_init(&self, _ins: InsId, addr: usize, count: u32) -> HookResult<()> {
        self.run(None, sync::barrier::init(addr, count))
    }

    fn barrier_wait(&self, _ins: InsId, addr: usize) -> HookResult<BarrierWaitResult> {
        self.run(None, sync::barrier::wait(addr))
    }

    fn barrier_destroy(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::barrier::destroy(addr))
    }

    fn sem_init(&self, _ins: InsId, addr: usize, value: u32) -> HookResult<()> {
        self.run(None, sync::sem::init(addr, value))
    }

    fn sem_wait(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::sem::wait(addr, false))
    }

    fn sem_trywait(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::sem::trywait(addr))
    }

    fn sem_timedwait(&self, _ins: InsId, addr: usize, timeout: Duration) -> HookResult<()> {
        self.run(Some(timeout), sync::sem::wait(addr, true))
    }

    fn sem_post(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::sem::post(addr))
    }

    fn sem_getvalue(&self, _ins: InsId, addr: usize) -> HookResult<i32> {
        self.run(None, sync::sem::getvalue(addr))
    }

    fn sem_destroy(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::sem::destroy(addr))
    }

    fn rwlock_init(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::init(addr))
    }

    fn rwlock_rdlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::rdlock(addr, false))
    }

    fn rwlock_wrlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::wrlock(addr, false))
    }

    fn rwlock_tryrdlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::rdlock(addr, true))
    }

    fn rwlock_trywrlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::wrlock(addr, true))
    }

    fn rwlock_unlock(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::unlock(addr))
    }

    fn rwlock_destroy(&self, _ins: InsId, addr: usize) -> HookResult<()> {
        self.run(None, sync::rwlock::destroy(addr))
    }

    fn sched_yield(&self, _ins: InsId) {
        thread::yield_now()
    }

    fn sleep(&self, _ins: InsId, duration: Duration) {
        thread::sleep(duration)
    }

    fn lineup_init(
        &self,
        _ins: InsId,
        _id: usize,
        count: u32,
        _timeout_turns: u64,
    ) -> HookResult<()> {
        if count == 0 {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    fn lineup_start(&self, _ins: InsId, _id: usize) -> HookResult<()> {
        Ok(())
    }

    fn lineup_end(&self, _ins: InsId, _id: usize) -> HookResult<()> {
        Ok(())
    }

    fn lineup_destroy(&self, _ins: InsId, _id: usize) -> HookResult<()> {
        Ok(())
    }

    fn nondet_enter(&self, _ins: InsId) {}

    fn nondet_exit(&self, _ins: InsId) {}

    fn nondet_barrier_exit(&self, _ins: InsId, _barrier: usize, _count: u32) {}

    fn external_call(&self, _ins: InsId, _op: ExternalOp, f: &mut dyn FnMut()) {
        f()
    }
}
