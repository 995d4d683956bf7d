/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Counting semaphores.

use std::task::Poll;

use nix::errno::Errno;

use super::OpCtx;
use crate::types::Channel;
use crate::types::HookResult;

/// Largest value a semaphore may hold.
pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

#[derive(Debug, Default, Clone)]
pub struct SemState {
    pub value: u32,
}

pub fn init(addr: usize, value: u32) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if value > SEM_VALUE_MAX {
            return Poll::Ready(Err(Errno::EINVAL));
        }
        ctx.tables.sems.insert(addr, SemState { value });
        Poll::Ready(Ok(()))
    }
}

/// Decrement, waiting while the value is zero. With `timed`, gives up with
/// ETIMEDOUT at the deadline.
pub fn wait(addr: usize, timed: bool) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let timed_out = ctx.timed_out();
        let st = match ctx.tables.sems.get_mut(&addr) {
            Some(st) => st,
            None => return Poll::Ready(Err(Errno::EINVAL)),
        };
        if st.value > 0 {
            st.value -= 1;
            Poll::Ready(Ok(()))
        } else if timed && timed_out {
            Poll::Ready(Err(Errno::ETIMEDOUT))
        } else if timed {
            ctx.block_on_timed(Channel::sync(addr))
        } else {
            ctx.block_on(Channel::sync(addr))
        }
    }
}

pub fn trywait(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| match ctx.tables.sems.get_mut(&addr) {
        None => Poll::Ready(Err(Errno::EINVAL)),
        Some(st) if st.value == 0 => Poll::Ready(Err(Errno::EAGAIN)),
        Some(st) => {
            st.value -= 1;
            Poll::Ready(Ok(()))
        }
    }
}

/// Increment and wake one waiter. Signals even when nobody waits; the waker
/// cannot see the waiters without looking at the scheduler.
pub fn post(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let st = match ctx.tables.sems.get_mut(&addr) {
            Some(st) => st,
            None => return Poll::Ready(Err(Errno::EINVAL)),
        };
        if st.value == SEM_VALUE_MAX {
            return Poll::Ready(Err(Errno::EOVERFLOW));
        }
        st.value += 1;
        ctx.signal(Channel::sync(addr));
        Poll::Ready(Ok(()))
    }
}

pub fn getvalue(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<i32>> {
    move |ctx| {
        Poll::Ready(
            ctx.tables
                .sems
                .get(&addr)
                .map(|s| s.value as i32)
                .ok_or(Errno::EINVAL),
        )
    }
}

pub fn destroy(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        Poll::Ready(
            ctx.tables
                .sems
                .remove(&addr)
                .map(|_| ())
                .ok_or(Errno::EINVAL),
        )
    }
}
