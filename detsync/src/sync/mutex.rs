/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mutex: Unlocked, or Locked by one owner. Waiters park on the mutex's
//! address and retry when the owner unlocks.

use std::task::Poll;
use std::thread::ThreadId;

use nix::errno::Errno;

use super::OpCtx;
use crate::types::Channel;
use crate::types::HookResult;

#[derive(Debug, Default, Clone)]
pub struct MutexState {
    pub owner: Option<ThreadId>,
}

fn owner(ctx: &mut OpCtx<'_>, addr: usize) -> Option<ThreadId> {
    ctx.tables.mutexes.entry(addr).or_default().owner
}

fn set_owner(ctx: &mut OpCtx<'_>, addr: usize, owner: Option<ThreadId>) {
    ctx.tables.mutexes.entry(addr).or_default().owner = owner;
}

pub fn init(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if owner(ctx, addr).is_some() {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.mutexes.insert(addr, MutexState::default());
        Poll::Ready(Ok(()))
    }
}

/// Blocking lock. With `timed`, gives up with ETIMEDOUT at the deadline.
pub fn lock(addr: usize, timed: bool) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| try_acquire(ctx, addr, timed)
}

/// Acquire if free. Shared with the re-lock half of condition waits.
pub(crate) fn try_acquire(ctx: &mut OpCtx<'_>, addr: usize, timed: bool) -> Poll<HookResult<()>> {
    let me = ctx.me();
    match owner(ctx, addr) {
        None => {
            set_owner(ctx, addr, Some(me));
            Poll::Ready(Ok(()))
        }
        Some(o) if o == me => Poll::Ready(Err(Errno::EDEADLK)),
        Some(_) if timed && ctx.timed_out() => Poll::Ready(Err(Errno::ETIMEDOUT)),
        Some(_) if timed => ctx.block_on_timed(Channel::sync(addr)),
        Some(_) => ctx.block_on(Channel::sync(addr)),
    }
}

/// Never waits; still takes a turn.
pub fn trylock(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let me = ctx.me();
        match owner(ctx, addr) {
            None => {
                set_owner(ctx, addr, Some(me));
                Poll::Ready(Ok(()))
            }
            Some(_) => Poll::Ready(Err(Errno::EBUSY)),
        }
    }
}

pub fn unlock(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| Poll::Ready(release(ctx, addr))
}

/// Unlock on behalf of the owner and wake one waiter.
pub(crate) fn release(ctx: &mut OpCtx<'_>, addr: usize) -> HookResult<()> {
    let me = ctx.me();
    if owner(ctx, addr) != Some(me) {
        return Err(Errno::EPERM);
    }
    set_owner(ctx, addr, None);
    ctx.signal(Channel::sync(addr));
    Ok(())
}

pub fn destroy(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if owner(ctx, addr).is_some() {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.mutexes.remove(&addr);
        Poll::Ready(Ok(()))
    }
}
