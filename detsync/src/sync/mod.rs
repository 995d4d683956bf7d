/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Emulated synchronization primitives.
//!
//! Each operation is a step function over the shared primitive tables. A step
//! either completes, or names the channel it must wait on and returns
//! `Poll::Pending`. The same step is driven two ways: under the turn, where
//! blocking means `Turn::wait` on the channel, and natively (inside
//! non-deterministic regions or without turn enforcement), where blocking
//! means sleeping on a condition variable and re-polling.

pub mod barrier;
pub mod cond;
pub mod mutex;
pub mod rwlock;
pub mod sem;

use std::collections::BTreeMap;
use std::task::Poll;
use std::thread::ThreadId;

use crate::types::Channel;

/// State of every emulated primitive, keyed by address.
#[derive(Debug, Default)]
pub struct SyncTables {
    pub mutexes: BTreeMap<usize, mutex::MutexState>,
    pub conds: BTreeMap<usize, cond::CondState>,
    pub barriers: BTreeMap<usize, barrier::BarrierState>,
    pub sems: BTreeMap<usize, sem::SemState>,
    pub rwlocks: BTreeMap<usize, rwlock::RwLockState>,
}

/// What a step sees while it runs, and what it asks of its driver.
pub struct OpCtx<'a> {
    pub tables: &'a mut SyncTables,
    me: ThreadId,
    timed_out: bool,
    effects: OpEffects,
}

/// Requests a step leaves for its driver.
#[derive(Debug, Default)]
pub struct OpEffects {
    /// Channels to wake, and whether to wake all waiters.
    pub wakes: Vec<(Channel, bool)>,
    /// Channel to wait on before polling again, and whether the operation's
    /// deadline applies.
    pub blocked_on: Option<(Channel, bool)>,
    /// The first half of a two-part operation is done and should be logged.
    pub partial: bool,
    /// Let every queued thread run before completing.
    pub yield_turn: bool,
}

impl<'a> OpCtx<'a> {
    pub fn new(tables: &'a mut SyncTables, me: ThreadId, timed_out: bool) -> Self {
        OpCtx {
            tables,
            me,
            timed_out,
            effects: OpEffects::default(),
        }
    }

    /// Identity of the calling thread, for ownership checks.
    pub fn me(&self) -> ThreadId {
        self.me
    }

    /// Did the previous timed block end at its deadline?
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn signal(&mut self, chan: Channel) {
        self.effects.wakes.push((chan, false));
    }

    pub fn broadcast(&mut self, chan: Channel) {
        self.effects.wakes.push((chan, true));
    }

    /// Wait on `chan` with no deadline.
    pub fn block_on<T>(&mut self, chan: Channel) -> Poll<T> {
        self.effects.blocked_on = Some((chan, false));
        Poll::Pending
    }

    /// Wait on `chan` until the operation's deadline.
    pub fn block_on_timed<T>(&mut self, chan: Channel) -> Poll<T> {
        self.effects.blocked_on = Some((chan, true));
        Poll::Pending
    }

    pub fn first_half_done(&mut self) {
        self.effects.partial = true;
    }

    pub fn yield_turn(&mut self) {
        self.effects.yield_turn = true;
    }

    pub fn into_effects(self) -> OpEffects {
        self.effects
    }
}
