/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Barriers. The last arrival of a generation releases the others and gets
//! the serial result.

use std::task::Poll;

use nix::errno::Errno;

use super::OpCtx;
use crate::types::Channel;
use crate::types::HookResult;

/// Result of a successful barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierWaitResult {
    /// Exactly one thread per generation gets this.
    Serial,
    Normal,
}

#[derive(Debug, Clone)]
pub struct BarrierState {
    pub count: u32,
    pub arrived: u32,
    pub generation: u64,
}

pub fn init(addr: usize, count: u32) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| {
        if count == 0 {
            return Poll::Ready(Err(Errno::EINVAL));
        }
        if ctx.tables.barriers.get(&addr).map_or(false, |b| b.arrived > 0) {
            return Poll::Ready(Err(Errno::EBUSY));
        }
        ctx.tables.barriers.insert(
            addr,
            BarrierState {
                count,
                arrived: 0,
                generation: 0,
            },
        );
        Poll::Ready(Ok(()))
    }
}

pub fn wait(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<BarrierWaitResult>> {
    let mut joined: Option<u64> = None;
    move |ctx| {
        let st = match ctx.tables.barriers.get_mut(&addr) {
            Some(st) => st,
            None => return Poll::Ready(Err(Errno::EINVAL)),
        };
        match joined {
            Some(gen) if st.generation != gen => Poll::Ready(Ok(BarrierWaitResult::Normal)),
            Some(_) => ctx.block_on(Channel::sync(addr)),
            None => {
                st.arrived += 1;
                if st.arrived == st.count {
                    st.arrived = 0;
                    st.generation += 1;
                    ctx.broadcast(Channel::sync(addr));
                    ctx.yield_turn();
                    Poll::Ready(Ok(BarrierWaitResult::Serial))
                } else {
                    joined = Some(st.generation);
                    ctx.block_on(Channel::sync(addr))
                }
            }
        }
    }
}

pub fn destroy(addr: usize) -> impl FnMut(&mut OpCtx<'_>) -> Poll<HookResult<()>> {
    move |ctx| match ctx.tables.barriers.get(&addr) {
        None => Poll::Ready(Err(Errno::EINVAL)),
        Some(b) if b.arrived > 0 => Poll::Ready(Err(Errno::EBUSY)),
        Some(_) => {
            ctx.tables.barriers.remove(&addr);
            Poll::Ready(Ok(()))
        }
    }
}
