/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reader/writer locks. Readers share, a writer excludes everyone. Every
//! waiter parks on the lock's address; all of them retry once the lock is
//! free.

use std::collections::HashMap;
use std::task::Poll;
use std::thread::ThreadId;

use nix::errno::Errno;

use super::OpCtx;
use crate::types::Channel;
use crate::types::HookResult;

#[derive(Debug, Default, Clone)]
pub struct RwLockState {
    pub writer: Option<ThreadId>,
    /// Read holds per thread; a thread may hold the read side more than once.
    pub readers: HashMap<ThreadId, u32>,
    pub nreaders: u32,
}

impl RwLockState {
    fn is_free(&self) -> bool {
        self.writer.is_none() && self.nreaders == 0
    }
}

pub fn init(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if ctx.tables.rwlocks.get(&addr).map_or(false, |l| !l.is_free()) {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.rwlocks.insert(addr, RwLockState::default());
        Poll::Ready(Ok(()))
    }
}

pub fn rdlock(addr: usize, try_only: bool) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let me = ctx.me();
        let st = ctx.tables.rwlocks.entry(addr).or_default();
        match st.writer {
            Some(_) if try_only => Poll::Ready(Err(Errno::EBUSY)),
            Some(w) if w == me => Poll::Ready(Err(Errno::EDEADLK)),
            Some(_) => ctx.block_on(Channel::sync(addr)),
            None => {
                *st.readers.entry(me).or_insert(0) += 1;
                st.nreaders += 1;
                Poll::Ready(Ok(()))
            }
        }
    }
}

pub fn wrlock(addr: usize, try_only: bool) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let me = ctx.me();
        let st = ctx.tables.rwlocks.entry(addr).or_default();
        if st.is_free() {
            st.writer = Some(me);
            Poll::Ready(Ok(()))
        } else if try_only {
            // Busy, even when the caller is the one holding it.
            Poll::Ready(Err(Errno::EBUSY))
        } else if st.writer == Some(me) || st.readers.contains_key(&me) {
            Poll::Ready(Err(Errno::EDEADLK))
        } else {
            ctx.block_on(Channel::sync(addr))
        }
    }
}

pub fn unlock(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        let me = ctx.me();
        let st = ctx.tables.rwlocks.entry(addr).or_default();
        if st.writer == Some(me) {
            st.writer = None;
        } else if let Some(n) = st.readers.get_mut(&me) {
            *n -= 1;
            if *n == 0 {
                st.readers.remove(&me);
            }
            st.nreaders -= 1;
        } else {
            return Poll::Ready(Err(Errno::EPERM));
        }
        if st.is_free() {
            ctx.broadcast(Channel::sync(addr));
        }
        Poll::Ready(Ok(()))
    }
}

pub fn destroy(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if ctx.tables.rwlocks.get(&addr).map_or(false, |l| !l.is_free()) {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.rwlocks.remove(&addr);
        Poll::Ready(Ok(()))
    }
}
