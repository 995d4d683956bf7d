/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The turn scheduler.
//!
//! A single turn is passed between threads. Only the holder may touch
//! scheduler-visible state, and every operation that takes effect consumes
//! one value of the turn counter. The sequence of those values is the
//! replayable total order recorded in the turn log.
//!
//! The turn is represented by the scheduler lock plus a holder field: a thread
//! holds the turn when it owns the lock and is the recorded holder, which it
//! expresses by owning a [`Turn`]. Waiting for the turn means sleeping on a
//! per-thread condition variable until the thread is at the head of the run
//! queue and nobody holds the turn.
//!
//! Methods pair up. Every way of getting the turn must be followed by exactly
//! one way of giving it up before anyone else can make progress:
//!
//! | Gets the turn | Gives up the turn |
//! |---|---|
//! | `get_turn` | `Turn::put_turn` |
//! | `thread_begin` | `Turn::wait` (and gets it back) |
//! | `wakeup` | `Turn::stop` (block) |
//! | | `Turn::end_thread` |

mod runqueue;
mod timed_waiters;
mod wait_queue;

use std::collections::BTreeMap;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread;
use std::thread::ThreadId;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use detsync_model::Config;
use detsync_model::RuntimeStats;
use detsync_model::SchedHeuristic;
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
pub use runqueue::RunQueue;
pub use runqueue::ThreadStatus;
pub use timed_waiters::TimedWaiters;
use tracing::trace;
pub use wait_queue::WaitQueue;

use crate::detlog;
use crate::lineup::LineupGroup;
use crate::nondet::NonDetState;
use crate::registry::ThreadRegistry;
use crate::sync::SyncTables;
use crate::turn_log::TurnLog;
use crate::types::Channel;
use crate::types::DetTid;
use crate::types::InsId;
use crate::types::Phase;
use crate::types::SyncOp;
use crate::types::TurnRecord;
use crate::types::WaitStatus;

/// Upper bound on any relative timeout, in turns.
pub const MAX_TIMEOUT_TURNS: u64 = 1_000_000;

/// Turn counter, run queue and wait lists.
#[derive(Debug)]
pub struct TurnState {
    turn: u64,
    holder: Option<DetTid>,
    run_queue: RunQueue,
    waiters: WaitQueue,
    timed: TimedWaiters,
    /// Outcome of a finished wait, until the waiter picks it up.
    wake_status: BTreeMap<DetTid, WaitStatus>,
    /// Threads running outside scheduler control that will come back.
    stopped: usize,
    heuristic: SchedHeuristic,
    prng: Pcg64Mcg,
}

impl TurnState {
    /// Empty state for up to `capacity` threads.
    pub fn new(capacity: usize, heuristic: SchedHeuristic, seed: u64) -> Self {
        if heuristic == SchedHeuristic::Random {
            detlog!("SCHEDRAND: seeding scheduler with seed {}", seed);
        }
        TurnState {
            turn: 0,
            holder: None,
            run_queue: RunQueue::with_capacity(capacity),
            waiters: WaitQueue::default(),
            timed: TimedWaiters::default(),
            wake_status: BTreeMap::new(),
            stopped: 0,
            heuristic,
            prng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    /// The next value the turn counter will hand out.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Who holds the turn right now.
    pub fn holder(&self) -> Option<DetTid> {
        self.holder
    }

    pub fn run_queue(&self) -> &RunQueue {
        &self.run_queue
    }

    pub fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    pub fn timed(&self) -> &TimedWaiters {
        &self.timed
    }

    /// Threads currently outside scheduler control.
    pub fn stopped(&self) -> usize {
        self.stopped
    }

    /// Would `tid` receive the turn if it asked now?
    pub fn is_next(&self, tid: DetTid) -> bool {
        self.holder.is_none() && self.run_queue.front() == Some(tid)
    }

    /// Give a newly registered thread its slot, at the back of the queue.
    pub fn create(&mut self, tid: DetTid) {
        self.run_queue.create_slot(tid);
        self.run_queue.push_back(tid);
    }

    /// Release the slot of a reclaimed thread.
    pub fn destroy(&mut self, tid: DetTid) {
        self.run_queue.destroy_slot(tid);
    }

    /// Make `tid`, the head of the queue, the holder.
    pub fn take_turn(&mut self, tid: DetTid) {
        if let Some(h) = self.holder {
            panic!(
                "Invariant violation! {} took the turn while {} holds it",
                tid, h
            );
        }
        if self.run_queue.front() != Some(tid) {
            panic!(
                "Invariant violation! {} took the turn from queue position other than the head: {}",
                tid, self.run_queue
            );
        }
        self.holder = Some(tid);
        self.run_queue.set_status(tid, ThreadStatus::RunningRegular);
        trace!("[turn {}] {} got the turn", self.turn, tid);
    }

    fn give_up(&mut self, tid: DetTid) {
        if self.holder != Some(tid) {
            panic!(
                "Invariant violation! {} gave up the turn, but the holder is {:?}",
                tid, self.holder
            );
        }
        let head = self.run_queue.pop_front();
        debug_assert_eq!(head, Some(tid));
        self.holder = None;
    }

    /// putTurn: back of the queue, and the next thread runs.
    pub fn put(&mut self, tid: DetTid) {
        self.give_up(tid);
        self.run_queue.push_back(tid);
        self.run_queue.set_status(tid, ThreadStatus::Runnable);
        self.dispatch();
    }

    /// Leave the queue and wait on `chan` until signaled, or until the turn
    /// counter passes `deadline`.
    pub fn park(&mut self, tid: DetTid, chan: Channel, deadline: Option<u64>) {
        self.give_up(tid);
        self.run_queue.set_status(tid, ThreadStatus::Parked);
        self.waiters.park(tid, chan);
        if let Some(deadline) = deadline {
            self.timed.insert(deadline, tid);
        }
        trace!(
            "[turn {}] {} parked on {} (deadline {:?})",
            self.turn,
            tid,
            chan,
            deadline
        );
        self.dispatch();
    }

    /// block(): leave the queue to run outside scheduler control.
    pub fn stop(&mut self, tid: DetTid) {
        self.give_up(tid);
        self.run_queue
            .set_status(tid, ThreadStatus::InterProcessStopped);
        self.stopped += 1;
        self.dispatch();
    }

    /// Leave the queue for good.
    pub fn exit(&mut self, tid: DetTid) {
        self.give_up(tid);
        self.run_queue.set_status(tid, ThreadStatus::Exited);
        self.dispatch();
    }

    /// wakeup(): a stopped thread re-enters the back of the queue.
    pub fn admit(&mut self, tid: DetTid) {
        if self.run_queue.status(tid) != ThreadStatus::InterProcessStopped {
            panic!(
                "Invariant violation! {} woke up without having blocked ({:?})",
                tid,
                self.run_queue.status(tid)
            );
        }
        self.stopped -= 1;
        self.run_queue
            .set_status(tid, ThreadStatus::RunningInterProcess);
        self.run_queue.push_back(tid);
    }

    /// signal/broadcast by the holder: woken threads run right after it, in
    /// parking order.
    pub fn wake(&mut self, by: DetTid, chan: Channel, all: bool) -> usize {
        if self.holder != Some(by) {
            panic!(
                "Invariant violation! {} signaled {} without holding the turn",
                by, chan
            );
        }
        let woken = self.waiters.take(chan, all);
        let mut anchor = by;
        for tid in &woken {
            self.timed.remove(*tid);
            self.run_queue.insert_after(anchor, *tid);
            self.requeued(*tid, WaitStatus::Signaled);
            anchor = *tid;
        }
        woken.len()
    }

    /// Wake parked threads from outside the turn, e.g. from a non-deterministic
    /// region. They join the back of the queue.
    pub fn wake_outside(&mut self, chan: Channel, all: bool) -> usize {
        let woken = self.waiters.take(chan, all);
        for tid in &woken {
            self.timed.remove(*tid);
            self.run_queue.push_back(*tid);
            self.requeued(*tid, WaitStatus::Signaled);
        }
        woken.len()
    }

    fn requeued(&mut self, tid: DetTid, status: WaitStatus) {
        self.run_queue.set_status(tid, ThreadStatus::Runnable);
        self.wake_status.insert(tid, status);
        trace!("[turn {}] {} requeued: {:?}", self.turn, tid, status);
    }

    /// How the last wait of `tid` ended.
    pub fn take_wake_status(&mut self, tid: DetTid) -> WaitStatus {
        match self.wake_status.remove(&tid) {
            Some(status) => status,
            None => panic!("Invariant violation! {} resumed without being woken", tid),
        }
    }

    /// incTurnCount: returns the previous value.
    pub fn inc_turn(&mut self) -> u64 {
        let t = self.turn;
        self.turn += 1;
        self.fire_timeouts();
        t
    }

    fn fire_timeouts(&mut self) {
        while let Some((deadline, tid)) = self.timed.pop_expired(self.turn) {
            if self.waiters.remove(tid).is_none() {
                panic!(
                    "Invariant violation! {} had a deadline but was not parked",
                    tid
                );
            }
            trace!(
                "[turn {}] {} timed out (deadline {})",
                self.turn,
                tid,
                deadline
            );
            self.run_queue.push_back(tid);
            self.requeued(tid, WaitStatus::TimedOut);
        }
    }

    /// Choose the next holder after the turn was given up.
    fn dispatch(&mut self) {
        if self.run_queue.is_empty() {
            // Nobody can make progress before the earliest timeout, so skip ahead to it.
            if let Some(deadline) = self.timed.next_deadline() {
                let target = deadline + 1;
                if target > self.turn {
                    trace!("fast-forwarding turn {} to {}", self.turn, target);
                    self.turn = target;
                }
                self.fire_timeouts();
            }
        }
        if self.run_queue.is_empty() {
            if !self.waiters.is_empty() && self.stopped == 0 {
                let parked: Vec<String> = self
                    .waiters
                    .iter()
                    .map(|(t, c)| format!("{} on {}", t, c))
                    .collect();
                panic!(
                    "Deadlock! Every live thread waits and none can wake them: {}",
                    parked.join(", ")
                );
            }
            return;
        }
        if self.heuristic == SchedHeuristic::Random && self.run_queue.len() > 1 {
            let len = self.run_queue.len();
            let idx = self.prng.gen_range(0..len);
            detlog!("SCHEDRAND: [0,{}) => {}", len, idx);
            if idx > 0 {
                let picked = self
                    .run_queue
                    .iter()
                    .nth(idx)
                    .expect("Invariant violation! Random pick outside the run queue");
                self.run_queue.erase(picked);
                self.run_queue.push_front(picked);
            }
        }
    }

    /// Forget every thread but the caller, which keeps the turn as id 0.
    /// Used in a freshly forked process image.
    pub fn reset_for_fork(&mut self) -> DetTid {
        let main = DetTid::MAIN;
        self.run_queue.deep_clear();
        self.waiters.clear();
        self.timed.clear();
        self.wake_status.clear();
        self.stopped = 0;
        self.run_queue.create_slot(main);
        self.run_queue.push_back(main);
        self.holder = None;
        self.take_turn(main);
        main
    }
}

/// Everything guarded by the scheduler lock.
#[derive(Debug)]
pub struct SchedState {
    pub turns: TurnState,
    pub registry: ThreadRegistry,
    pub tables: SyncTables,
    pub lineups: BTreeMap<usize, LineupGroup>,
    pub nondet: NonDetState,
    pub log: TurnLog,
    pub stats: RuntimeStats,
    record_stats: bool,
    nanos_per_turn: u64,
}

impl SchedState {
    pub fn new(cfg: &Config, log: TurnLog) -> Self {
        SchedState {
            turns: TurnState::new(cfg.max_threads, cfg.sched_heuristic, cfg.sched_seed),
            registry: ThreadRegistry::new(cfg.max_threads),
            tables: SyncTables::default(),
            lineups: BTreeMap::new(),
            nondet: NonDetState::default(),
            log,
            stats: RuntimeStats::default(),
            record_stats: cfg.record_runtime_stat,
            nanos_per_turn: cfg.nanos_per_turn.max(1),
        }
    }

    /// threadCreate: register a thread and queue it.
    pub fn register_thread(&mut self, handle: ThreadId) -> DetTid {
        let tid = self.registry.register(handle);
        self.turns.create(tid);
        tid
    }

    /// The calling thread's id.
    pub fn current(&self) -> DetTid {
        self.registry.self_id(thread::current().id())
    }

    /// Is `tid` inside the block of a lineup round, between start and end?
    pub fn in_lineup(&self, tid: DetTid) -> bool {
        self.lineups.values().any(|g| g.runs_in_block(tid))
    }

    /// Does `tid` currently run outside turn discipline, in a non-det region
    /// or a lineup block? Its primitive operations then run natively.
    pub fn runs_freely(&self, tid: DetTid) -> bool {
        self.nondet.contains(tid) || self.in_lineup(tid)
    }

    /// Might some thread be blocked natively, waiting for a release?
    pub fn anyone_runs_freely(&self) -> bool {
        !self.nondet.is_empty() || self.lineups.values().any(LineupGroup::is_running)
    }

    /// Convert a wall-clock timeout into turns.
    pub fn timeout_turns(&self, timeout: Duration) -> u64 {
        let floor = 5 * self.registry.live_count() as u64 + 1;
        let turns = timeout.as_nanos() / self.nanos_per_turn as u128;
        (turns.min(MAX_TIMEOUT_TURNS as u128) as u64).clamp(floor, MAX_TIMEOUT_TURNS)
    }

    /// Update the counters, if they are being recorded.
    pub fn tally(&mut self, f: impl FnOnce(&mut RuntimeStats)) {
        if self.record_stats {
            f(&mut self.stats)
        }
    }

    pub fn records_stats(&self) -> bool {
        self.record_stats
    }
}

/// The scheduler: its state behind one lock, and one condition variable per
/// thread slot to hand the turn to exactly the thread that should run.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<SchedState>,
    slots: Box<[Condvar]>,
    /// Threads in non-deterministic regions block here instead of on the turn.
    pub(crate) native: Condvar,
}

impl Scheduler {
    pub fn new(state: SchedState) -> Self {
        let capacity = state.turns.run_queue.capacity();
        Scheduler {
            state: Mutex::new(state),
            slots: (0..capacity).map(|_| Condvar::new()).collect(),
            native: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state
            .lock()
            .expect("Invariant violation! Scheduler state poisoned")
    }

    /// Wake the head of the queue if the turn is free.
    pub(crate) fn kick(&self, turns: &TurnState) {
        if turns.holder.is_none() {
            if let Some(front) = turns.run_queue.front() {
                self.slots[front.index()].notify_one();
            }
        }
    }

    /// Sleep until `tid` is next, then take the turn.
    fn await_turn<'a>(
        &'a self,
        guard: MutexGuard<'a, SchedState>,
        tid: DetTid,
    ) -> MutexGuard<'a, SchedState> {
        let mut guard = self.slots[tid.index()]
            .wait_while(guard, |st| !st.turns.is_next(tid))
            .expect("Invariant violation! Scheduler state poisoned");
        guard.turns.take_turn(tid);
        guard
    }

    /// getTurn for a thread that the caller already looked up under the lock.
    pub(crate) fn get_turn_locked<'a>(
        &'a self,
        guard: MutexGuard<'a, SchedState>,
        tid: DetTid,
        ins: InsId,
        call_time: DateTime<Utc>,
    ) -> Turn<'a> {
        if guard.nondet.contains(tid) {
            panic!(
                "Invariant violation! {} asked for the turn inside a non-det region",
                tid
            );
        }
        if guard.in_lineup(tid) {
            panic!(
                "Invariant violation! {} asked for the turn inside a lineup block",
                tid
            );
        }
        if !guard.turns.run_queue.contains(tid) {
            panic!(
                "Invariant violation! {} asked for the turn while {:?}",
                tid,
                guard.turns.run_queue.status(tid)
            );
        }
        if guard.turns.holder == Some(tid) {
            panic!("Invariant violation! {} already holds the turn", tid);
        }
        self.turn_when_queued(guard, tid, ins, call_time)
    }

    /// Wait for the turn without checking queue membership first: the caller
    /// is about to be queued by another thread.
    pub(crate) fn turn_when_queued<'a>(
        &'a self,
        guard: MutexGuard<'a, SchedState>,
        tid: DetTid,
        ins: InsId,
        call_time: DateTime<Utc>,
    ) -> Turn<'a> {
        let guard = self.await_turn(guard, tid);
        Turn {
            sched: self,
            guard: Some(guard),
            tid,
            ins,
            call_time,
        }
    }

    /// getTurn for the calling thread.
    pub fn get_turn(&self, ins: InsId) -> Turn<'_> {
        let call_time = Utc::now();
        let guard = self.lock();
        let tid = guard.current();
        self.get_turn_locked(guard, tid, ins, call_time)
    }

    /// wakeup: a thread that stopped re-enters the queue and takes the turn.
    pub(crate) fn rejoin_locked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, SchedState>,
        tid: DetTid,
        ins: InsId,
        call_time: DateTime<Utc>,
    ) -> Turn<'a> {
        guard.turns.admit(tid);
        self.kick(&guard.turns);
        self.turn_when_queued(guard, tid, ins, call_time)
    }
}

/// Proof that the current thread holds the turn. It must be given up with
/// exactly one of [`Turn::put_turn`], [`Turn::stop`] or [`Turn::end_thread`].
pub struct Turn<'a> {
    sched: &'a Scheduler,
    guard: Option<MutexGuard<'a, SchedState>>,
    tid: DetTid,
    ins: InsId,
    call_time: DateTime<Utc>,
}

impl<'a> Turn<'a> {
    /// The holder.
    pub fn tid(&self) -> DetTid {
        self.tid
    }

    pub fn state(&mut self) -> &mut SchedState {
        self.guard.as_deref_mut().expect("Invariant violation! Turn already released")
    }

    fn state_ref(&self) -> &SchedState {
        self.guard.as_deref().expect("Invariant violation! Turn already released")
    }

    /// The value the next `inc_turn_count` will return.
    pub fn turn_count(&self) -> u64 {
        self.state_ref().turns.turn
    }

    pub fn inc_turn_count(&mut self) -> u64 {
        self.state().turns.inc_turn()
    }

    /// Count the operation and append it to the turn log. Returns its turn.
    pub fn commit(&mut self, op: SyncOp, phase: Phase, args: &[u64], ret: i32) -> u64 {
        let (tid, ins, call_time) = (self.tid, self.ins, self.call_time);
        let st = self.state();
        let turn = st.turns.inc_turn();
        st.log.append(TurnRecord {
            turn,
            tid,
            op,
            phase,
            ins,
            args: args.to_vec(),
            ret,
            call_time,
            return_time: Utc::now(),
        });
        turn
    }

    /// Move the oldest waiter on `chan` to run right after this turn.
    pub fn signal(&mut self, chan: Channel) -> bool {
        let tid = self.tid;
        let n = self.state().turns.wake(tid, chan, false);
        self.notify_native();
        n > 0
    }

    /// Move every waiter on `chan`, keeping their parking order.
    pub fn broadcast(&mut self, chan: Channel) -> usize {
        let tid = self.tid;
        let n = self.state().turns.wake(tid, chan, true);
        self.notify_native();
        n
    }

    fn notify_native(&self) {
        if self.state_ref().anyone_runs_freely() {
            self.sched.native.notify_all();
        }
    }

    /// Park on `chan`, releasing the turn, and return holding it again once
    /// signaled or once the counter passes `deadline`.
    pub fn wait(&mut self, chan: Channel, deadline: Option<u64>) -> WaitStatus {
        let tid = self.tid;
        self.state().turns.park(tid, chan, deadline);
        self.sched.kick(&self.state_ref().turns);
        self.reacquire();
        self.state().turns.take_wake_status(tid)
    }

    /// putTurn followed by getTurn: everyone queued runs first.
    pub fn yield_turn(&mut self) {
        let tid = self.tid;
        self.state().turns.put(tid);
        self.sched.kick(&self.state_ref().turns);
        self.reacquire();
    }

    fn reacquire(&mut self) {
        let guard = self.guard.take().expect("Invariant violation! Turn already released");
        self.guard = Some(self.sched.await_turn(guard, self.tid));
    }

    fn release(mut self, f: impl FnOnce(&mut TurnState, DetTid)) {
        let mut guard = self.guard.take().expect("Invariant violation! Turn already released");
        f(&mut guard.turns, self.tid);
        self.sched.kick(&guard.turns);
    }

    /// putTurn.
    pub fn put_turn(self) {
        self.release(TurnState::put)
    }

    /// block: give up the turn without requeueing, to run outside scheduler
    /// control until [`Scheduler::rejoin_locked`].
    pub fn stop(self) {
        self.release(TurnState::stop)
    }

    /// The holder exits and never asks for the turn again.
    pub fn end_thread(self) {
        self.release(TurnState::exit)
    }

    /// Adopt a freshly forked process image: the caller becomes the only
    /// thread, id 0, and keeps the turn.
    pub fn adopt_forked_process(&mut self) {
        let st = self.state();
        st.registry.clear();
        let main = st.registry.register(thread::current().id());
        st.registry.begin(thread::current().id());
        st.turns.reset_for_fork();
        st.lineups.clear();
        st.nondet.clear();
        st.log.reopen_for_child();
        self.tid = main;
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() && !thread::panicking() {
            panic!(
                "Invariant violation! {} dropped the turn without giving it up",
                self.tid
            );
        }
    }
}
