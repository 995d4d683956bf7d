/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mapping from OS threads to dense deterministic ids, with their lifecycle.
//!
//! None of these operations take the turn. Creation and joining must happen
//! while the caller holds it, which is what keeps id assignment deterministic.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::thread::ThreadId;

use crate::types::DetTid;

/// Lifecycle of a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Registered or running.
    Active,
    /// Exited, waiting to be joined. Its id stays reserved.
    Zombie,
}

#[derive(Debug, Clone)]
struct ThreadRecord {
    handle: ThreadId,
    state: ThreadState,
    /// Set once the thread itself has called `begin`.
    begun: bool,
}

/// The registry of every live monitored thread.
#[derive(Debug, Clone)]
pub struct ThreadRegistry {
    records: BTreeMap<DetTid, ThreadRecord>,
    by_handle: HashMap<ThreadId, DetTid>,
    next_id: u32,
    capacity: usize,
}

impl fmt::Display for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (ix, (tid, rec)) in self.records.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {:?}", tid, rec.state)?;
        }
        write!(f, "}}")
    }
}

impl ThreadRegistry {
    /// An empty registry that hands out ids below `capacity`.
    pub fn new(capacity: usize) -> Self {
        ThreadRegistry {
            records: BTreeMap::new(),
            by_handle: HashMap::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Assign the next internal id to `handle`. Ids are never reused.
    pub fn register(&mut self, handle: ThreadId) -> DetTid {
        if let Some(existing) = self.by_handle.get(&handle) {
            panic!(
                "Invariant violation! {:?} registered twice (already {})",
                handle, existing
            );
        }
        if self.next_id as usize >= self.capacity {
            panic!(
                "Invariant violation! Thread limit of {} exceeded",
                self.capacity
            );
        }
        let tid = DetTid::from_raw(self.next_id);
        self.next_id += 1;
        self.records.insert(
            tid,
            ThreadRecord {
                handle,
                state: ThreadState::Active,
                begun: false,
            },
        );
        self.by_handle.insert(handle, tid);
        tid
    }

    /// Called by the thread owning `handle` before its first hook. Idempotent.
    pub fn begin(&mut self, handle: ThreadId) -> DetTid {
        let tid = match self.by_handle.get(&handle) {
            Some(tid) => *tid,
            None => panic!("Invariant violation! {:?} began without being registered", handle),
        };
        let rec = self.record_mut(tid);
        if rec.state != ThreadState::Active {
            panic!("Invariant violation! Zombie thread {} began again", tid);
        }
        rec.begun = true;
        tid
    }

    /// Move a record to Zombie at thread exit.
    pub fn end(&mut self, tid: DetTid) {
        let rec = self.record_mut(tid);
        if rec.state == ThreadState::Zombie {
            panic!("Invariant violation! Thread {} ended twice", tid);
        }
        rec.state = ThreadState::Zombie;
    }

    /// Delete a Zombie record once its OS thread has been joined.
    pub fn reap(&mut self, tid: DetTid) {
        let rec = self.record_mut(tid);
        if rec.state != ThreadState::Zombie {
            panic!("Invariant violation! Joining thread {} which is still active", tid);
        }
        let handle = rec.handle;
        self.records.remove(&tid);
        self.by_handle.remove(&handle);
    }

    /// The internal id of the calling OS thread. Calling this before `begin` is an error.
    pub fn self_id(&self, handle: ThreadId) -> DetTid {
        match self.by_handle.get(&handle) {
            Some(tid) if self.records[tid].begun => *tid,
            Some(tid) => panic!(
                "Invariant violation! Thread {} used the runtime before beginning",
                tid
            ),
            None => panic!(
                "Invariant violation! {:?} is not a thread of this runtime",
                handle
            ),
        }
    }

    /// Non-panicking lookup of a begun thread.
    pub fn lookup(&self, handle: ThreadId) -> Option<DetTid> {
        let tid = self.by_handle.get(&handle)?;
        self.records[tid].begun.then_some(*tid)
    }

    /// Lifecycle state of `tid`, or None once reclaimed.
    pub fn state(&self, tid: DetTid) -> Option<ThreadState> {
        self.records.get(&tid).map(|r| r.state)
    }

    pub fn is_zombie(&self, tid: DetTid) -> bool {
        self.state(tid) == Some(ThreadState::Zombie)
    }

    /// Threads that have not exited.
    pub fn live_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == ThreadState::Active)
            .count()
    }

    /// How many ids were handed out so far.
    pub fn total_registered(&self) -> u64 {
        self.next_id as u64
    }

    /// Forget every thread, including the id counter.
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_handle.clear();
        self.next_id = 0;
    }

    fn record_mut(&mut self, tid: DetTid) -> &mut ThreadRecord {
        match self.records.get_mut(&tid) {
            Some(rec) => rec,
            None => panic!("Invariant violation! Unknown thread {}", tid),
        }
    }
}
