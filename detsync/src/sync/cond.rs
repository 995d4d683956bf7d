/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Condition variables.
//!
//! A wait releases the mutex, parks on the condition's address, then
//! re-acquires the mutex. Wakeups are handed out as tokens so that a signal
//! releases exactly one waiter even when every parked thread re-polls.

use std::task::Poll;

use nix::errno::Errno;

use super::mutex;
use super::OpCtx;
use crate::types::Channel;
use crate::types::HookResult;

#[derive(Debug, Default, Clone)]
pub struct CondState {
    /// Threads between releasing the mutex and being woken.
    pub waiters: u32,
    /// Wakeups issued but not yet consumed.
    pub wakeups: u32,
}

pub fn init(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if ctx.tables.conds.get(&addr).map_or(false, |c| c.waiters > 0) {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.conds.insert(addr, CondState::default());
        Poll::Ready(Ok(()))
    }
}

enum Stage {
    Release,
    Parked,
    Relock(HookResult<()>),
}

/// Wait on `cond` with `mutex` held. The mutex is held again on return, also
/// when the wait times out.
pub fn wait(
    cond: usize,
    mutex_addr: usize,
    timed: bool,
) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    let mut stage = Stage::Release;
    move |ctx| loop {
        match &stage {
            Stage::Release => {
                mutex::release(ctx, mutex_addr)?;
                ctx.tables.conds.entry(cond).or_default().waiters += 1;
                ctx.first_half_done();
                stage = Stage::Parked;
                return if timed {
                    ctx.block_on_timed(Channel::sync(cond))
                } else {
                    ctx.block_on(Channel::sync(cond))
                };
            }
            Stage::Parked => {
                let timed_out = timed && ctx.timed_out();
                let st = ctx.tables.conds.entry(cond).or_default();
                if timed_out {
                    st.waiters -= 1;
                    st.wakeups = st.wakeups.min(st.waiters);
                    stage = Stage::Relock(Err(Errno::ETIMEDOUT));
                } else if st.wakeups > 0 {
                    st.wakeups -= 1;
                    st.waiters -= 1;
                    stage = Stage::Relock(Ok(()));
                } else if timed {
                    return ctx.block_on_timed(Channel::sync(cond));
                } else {
                    return ctx.block_on(Channel::sync(cond));
                }
            }
            Stage::Relock(res) => {
                let res = *res;
                return match mutex::try_acquire(ctx, mutex_addr, false) {
                    Poll::Ready(Ok(())) => Poll::Ready(res),
                    other => other,
                };
            }
        }
    }
}

pub fn signal(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let st = ctx.tables.conds.entry(addr).or_default();
        if st.wakeups < st.waiters {
            st.wakeups += 1;
            ctx.signal(Channel::sync(addr));
        }
        Poll::Ready(Ok(()))
    }
}

pub fn broadcast(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let st = ctx.tables.conds.entry(addr).or_default();
        if st.wakeups < st.waiters {
            st.wakeups = st.waiters;
            ctx.broadcast(Channel::sync(addr));
        }
        Poll::Ready(Ok(()))
    }
}

pub fn destroy(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if ctx.tables.conds.get(&addr).map_or(false, |c| c.waiters > 0) {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.conds.remove(&addr);
        Poll::Ready(Ok(()))
    }
}
