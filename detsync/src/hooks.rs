/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The hook surface: one entry point per emulated operation.
//!
//! Every hook takes the instrumentation site it was called from and the
//! original arguments, with primitives identified by address, and returns the
//! native result or error code. Callers must treat the results exactly as
//! they would those of the native primitive.

use std::time::Duration;

use crate::sync::barrier::BarrierWaitResult;
use crate::types::ExternalOp;
use crate::types::HookResult;
use crate::types::InsId;

/// Operations a runtime provides to instrumented code.
pub trait SyncHooks: Send + Sync {
    fn mutex_init(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn mutex_lock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn mutex_trylock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    /// Lock, giving up with ETIMEDOUT once `timeout` has passed.
    fn mutex_timedlock(&self, ins: InsId, addr: usize, timeout: Duration) -> HookResult<()>;
    fn mutex_unlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn mutex_destroy(&self, ins: InsId, addr: usize) -> HookResult<()>;

    fn cond_init(&self, ins: InsId, addr: usize) -> HookResult<()>;
    /// Wait on `cond`, releasing `mutex` meanwhile. The caller must own
    /// `mutex`, and owns it again on return.
    fn cond_wait(&self, ins: InsId, cond: usize, mutex: usize) -> HookResult<()>;
    fn cond_timedwait(
        &self,
        ins: InsId,
        cond: usize,
        mutex: usize,
        timeout: Duration,
    ) -> HookResult<()>;
    fn cond_signal(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn cond_broadcast(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn cond_destroy(&self, ins: InsId, addr: usize) -> HookResult<()>;

    fn barrier_init(&self, ins: InsId, addr: usize, count: u32) -> HookResult<()>;
    fn barrier_wait(&self, ins: InsId, addr: usize) -> HookResult<BarrierWaitResult>;
    fn barrier_destroy(&self, ins: InsId, addr: usize) -> HookResult<()>;

    fn sem_init(&self, ins: InsId, addr: usize, value: u32) -> HookResult<()>;
    fn sem_wait(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn sem_trywait(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn sem_timedwait(&self, ins: InsId, addr: usize, timeout: Duration) -> HookResult<()>;
    fn sem_post(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn sem_getvalue(&self, ins: InsId, addr: usize) -> HookResult<i32>;
    fn sem_destroy(&self, ins: InsId, addr: usize) -> HookResult<()>;

    fn rwlock_init(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_rdlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_wrlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_tryrdlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_trywrlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_unlock(&self, ins: InsId, addr: usize) -> HookResult<()>;
    fn rwlock_destroy(&self, ins: InsId, addr: usize) -> HookResult<()>;

    fn sched_yield(&self, ins: InsId);
    fn sleep(&self, ins: InsId, duration: Duration);

    /// Register lineup group `id` of `count` threads. A round that is not
    /// full after `timeout_turns` turns starts with whoever arrived.
    fn lineup_init(&self, ins: InsId, id: usize, count: u32, timeout_turns: u64)
    -> HookResult<()>;
    /// Check in with lineup `id`; returns once the round starts. Until the
    /// matching `lineup_end` the caller runs outside turn discipline.
    fn lineup_start(&self, ins: InsId, id: usize) -> HookResult<()>;
    /// Leave the round; returns once every member of it has left.
    fn lineup_end(&self, ins: InsId, id: usize) -> HookResult<()>;
    fn lineup_destroy(&self, ins: InsId, id: usize) -> HookResult<()>;

    /// Start a non-deterministic region on the calling thread.
    fn nondet_enter(&self, ins: InsId);
    fn nondet_exit(&self, ins: InsId);
    /// Leave a region through barrier `barrier` of `count` participants.
    fn nondet_barrier_exit(&self, ins: InsId, barrier: usize, count: u32);

    /// Run `f`, which may block on something the scheduler cannot see.
    fn external_call(&self, ins: InsId, op: ExternalOp, f: &mut dyn FnMut());
}
