/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Lineups: a fixed group of threads checks in under the turn, then runs a
//! block concurrently, outside turn discipline, until every member checks
//! out.
//!
//! A round is Collecting until it is full, or until the first member's wait
//! for the others times out, in which case it starts with whoever arrived.
//! Threads arriving while a round runs wait for the next one. Once every
//! member of a round has ended, the members rejoin the run queue in thread
//! id order, independently of the order in which they ended.

use std::collections::BTreeSet;

use chrono::Utc;
use nix::errno::Errno;
use tracing::debug;

use crate::runtime::DetRuntime;
use crate::scheduler::SchedState;
use crate::scheduler::Turn;
use crate::types::Channel;
use crate::types::DetTid;
use crate::types::HookResult;
use crate::types::InsId;
use crate::types::Phase;
use crate::types::SyncOp;
use crate::types::WaitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineupState {
    Collecting,
    /// Started with every expected member.
    Running,
    /// Started short of members after the timeout.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct LineupGroup {
    pub expected: u32,
    pub timeout_turns: u64,
    pub arrived: BTreeSet<DetTid>,
    pub ended: BTreeSet<DetTid>,
    pub state: LineupState,
    /// Rounds started so far.
    pub rounds: u64,
}

impl LineupGroup {
    pub fn new(expected: u32, timeout_turns: u64) -> Self {
        LineupGroup {
            expected,
            timeout_turns,
            arrived: BTreeSet::new(),
            ended: BTreeSet::new(),
            state: LineupState::Collecting,
            rounds: 0,
        }
    }

    /// Has the current round started?
    pub fn is_running(&self) -> bool {
        self.state != LineupState::Collecting
    }

    /// Is `tid` a member of the running round that has not ended yet?
    pub fn runs_in_block(&self, tid: DetTid) -> bool {
        self.is_running() && self.arrived.contains(&tid) && !self.ended.contains(&tid)
    }

    /// Is a round collecting members or running?
    pub fn is_active(&self) -> bool {
        self.state != LineupState::Collecting || !self.arrived.is_empty()
    }

    fn launch(&mut self, state: LineupState) {
        self.state = state;
        self.rounds += 1;
    }

    /// Close the round and hand back its members, in id order.
    fn finish_round(&mut self) -> Vec<DetTid> {
        let members = std::mem::take(&mut self.arrived);
        self.ended.clear();
        self.state = LineupState::Collecting;
        members.into_iter().collect()
    }
}

pub(crate) fn init(
    st: &mut SchedState,
    id: usize,
    count: u32,
    timeout_turns: u64,
) -> HookResult<()> {
    if count == 0 {
        return Err(Errno::EINVAL);
    }
    if st.lineups.contains_key(&id) {
        return Err(Errno::EBUSY);
    }
    st.lineups.insert(id, LineupGroup::new(count, timeout_turns));
    Ok(())
}

pub(crate) fn destroy(st: &mut SchedState, id: usize) -> HookResult<()> {
    match st.lineups.get(&id) {
        None => Err(Errno::EINVAL),
        Some(g) if g.is_active() => Err(Errno::EBUSY),
        Some(_) => {
            st.lineups.remove(&id);
            Ok(())
        }
    }
}

pub(crate) fn start(rt: &DetRuntime, ins: InsId, id: usize) -> HookResult<()> {
    let call_time = Utc::now();
    let guard = rt.sched.lock();
    let tid = guard.current();
    if guard.runs_freely(tid) {
        return Ok(());
    }
    let mut turn = rt.sched.get_turn_locked(guard, tid, ins, call_time);

    // A round is under way: wait for the next one.
    loop {
        match turn.state().lineups.get(&id).map(|g| g.state) {
            None => return fail_start(turn, id, Errno::EINVAL),
            Some(LineupState::Collecting) => break,
            Some(_) => {
                turn.wait(Channel::lineup_round(id), None);
            }
        }
    }

    let group = group_mut(turn.state(), id);
    group.arrived.insert(tid);
    if group.arrived.len() as u32 >= group.expected {
        group.launch(LineupState::Running);
        turn.state().tally(|s| s.lineup_success += 1);
        turn.broadcast(Channel::lineup_arrive(id));
    } else {
        let timeout = group.timeout_turns;
        let deadline = turn.turn_count() + timeout;
        loop {
            let status = turn.wait(Channel::lineup_arrive(id), Some(deadline));
            let group = group_mut(turn.state(), id);
            if group.state != LineupState::Collecting {
                break;
            }
            if status == WaitStatus::TimedOut {
                debug!(
                    "Lineup {:#x} times out with {} of {} members",
                    id,
                    group.arrived.len(),
                    group.expected
                );
                group.launch(LineupState::TimedOut);
                turn.state().tally(|s| s.lineup_timeout += 1);
                turn.broadcast(Channel::lineup_arrive(id));
                break;
            }
        }
    }

    let members = group_mut(turn.state(), id).arrived.len() as u64;
    turn.commit(SyncOp::LineupStart, Phase::Complete, &[id as u64, members], 0);
    turn.stop();
    Ok(())
}

pub(crate) fn end(rt: &DetRuntime, ins: InsId, id: usize) -> HookResult<()> {
    let call_time = Utc::now();
    let mut guard = rt.sched.lock();
    let tid = guard.current();
    if guard.nondet.contains(tid) {
        return Ok(());
    }
    let group = match guard.lineups.get_mut(&id) {
        Some(g) if g.arrived.contains(&tid) && !g.ended.contains(&tid) => g,
        _ => return Err(Errno::EINVAL),
    };
    group.ended.insert(tid);
    if group.ended.len() == group.arrived.len() {
        let members = group.finish_round();
        debug!("Lineup {:#x} round ends, members {:?}", id, members);
        for m in members {
            guard.turns.admit(m);
        }
        guard.turns.wake_outside(Channel::lineup_round(id), true);
        rt.sched.kick(&guard.turns);
    }
    let mut turn = rt.sched.turn_when_queued(guard, tid, ins, call_time);
    turn.commit(SyncOp::LineupEnd, Phase::Complete, &[id as u64], 0);
    turn.put_turn();
    Ok(())
}

fn fail_start(mut turn: Turn<'_>, id: usize, e: Errno) -> HookResult<()> {
    turn.commit(SyncOp::LineupStart, Phase::Complete, &[id as u64], e as i32);
    turn.put_turn();
    Err(e)
}

fn group_mut(st: &mut SchedState, id: usize) -> &mut LineupGroup {
    match st.lineups.get_mut(&id) {
        Some(g) => g,
        None => panic!("Invariant violation! Lineup {:#x} vanished during a round", id),
    }
}
