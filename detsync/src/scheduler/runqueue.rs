/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The queue of threads eligible to receive the turn.
//!
//! This is an intrusive doubly-linked list laid over a fixed arena with one
//! slot per possible thread id. Links are ids rather than pointers, so every
//! operation is O(1) and no operation allocates after construction.
//!
//! While a thread holds the turn it stays at the head of the queue. Inserting
//! "second" therefore guarantees the inserted thread runs right after the
//! current holder gives up the turn.

use std::fmt;

use crate::types::DetTid;

/// Scheduling status of a thread's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Queued, waiting for the turn.
    Runnable,
    /// Holds the turn.
    RunningRegular,
    /// Queued again after returning from a blocking external call, a lineup
    /// or a non-deterministic region.
    RunningInterProcess,
    /// Running outside scheduler control. Never queued.
    InterProcessStopped,
    /// Waiting on a channel. Never queued.
    Parked,
    /// The thread has exited. Never queued.
    Exited,
}

impl ThreadStatus {
    /// Statuses whose slots must be linked into the queue.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            ThreadStatus::Runnable | ThreadStatus::RunningRegular | ThreadStatus::RunningInterProcess
        )
    }
}

#[derive(Debug, Clone)]
struct Slot {
    status: ThreadStatus,
    prev: Option<DetTid>,
    next: Option<DetTid>,
    /// Tracked independently of the links so the two can be checked against each other.
    linked: bool,
}

/// Fixed-capacity run queue.
#[derive(Debug, Clone)]
pub struct RunQueue {
    slots: Vec<Option<Slot>>,
    head: Option<DetTid>,
    tail: Option<DetTid>,
    len: usize,
}

/// A one-line print of the queue, head first.
impl fmt::Display for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (ix, tid) in self.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", tid)?;
        }
        write!(f, "]")
    }
}

impl RunQueue {
    /// Create an empty queue able to hold ids `0..capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        RunQueue {
            slots: vec![None; capacity],
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// The largest id this queue can hold, plus one.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, tid: DetTid) -> &Slot {
        match self.slots.get(tid.index()) {
            Some(Some(slot)) => slot,
            _ => panic!("Invariant violation! No run queue slot for thread {}", tid),
        }
    }

    fn slot_mut(&mut self, tid: DetTid) -> &mut Slot {
        match self.slots.get_mut(tid.index()) {
            Some(Some(slot)) => slot,
            _ => panic!("Invariant violation! No run queue slot for thread {}", tid),
        }
    }

    /// Prepare the slot of a newly registered thread. The thread starts out
    /// unlinked and Runnable.
    pub fn create_slot(&mut self, tid: DetTid) {
        let cap = self.capacity();
        match self.slots.get_mut(tid.index()) {
            None => panic!(
                "Invariant violation! Thread id {} exceeds run queue capacity {}",
                tid, cap
            ),
            Some(Some(_)) => panic!("Invariant violation! Slot for {} created twice", tid),
            Some(entry) => {
                *entry = Some(Slot {
                    status: ThreadStatus::Runnable,
                    prev: None,
                    next: None,
                    linked: false,
                })
            }
        }
    }

    /// Release the slot of a reclaimed thread.
    pub fn destroy_slot(&mut self, tid: DetTid) {
        if self.slot(tid).linked {
            panic!(
                "Invariant violation! Destroying slot of {} while it is queued: {}",
                tid, self
            );
        }
        self.slots[tid.index()] = None;
    }

    /// Whether `tid` has a slot.
    pub fn has_slot(&self, tid: DetTid) -> bool {
        matches!(self.slots.get(tid.index()), Some(Some(_)))
    }

    /// Current status of a slot.
    pub fn status(&self, tid: DetTid) -> ThreadStatus {
        self.slot(tid).status
    }

    /// Set the status of a slot. Linking is managed separately.
    pub fn set_status(&mut self, tid: DetTid, status: ThreadStatus) {
        self.slot_mut(tid).status = status;
    }

    fn link_check(&self, tid: DetTid) {
        if self.slot(tid).linked {
            panic!(
                "Invariant violation! Tried to add {} to run queue, but it's already present: {}",
                tid, self
            );
        }
    }

    /// Append; the tail is the lowest scheduling priority.
    pub fn push_back(&mut self, tid: DetTid) {
        self.link_check(tid);
        let old_tail = self.tail;
        {
            let slot = self.slot_mut(tid);
            slot.prev = old_tail;
            slot.next = None;
            slot.linked = true;
        }
        match old_tail {
            Some(t) => self.slot_mut(t).next = Some(tid),
            None => self.head = Some(tid),
        }
        self.tail = Some(tid);
        self.len += 1;
        self.membership_check();
    }

    /// Prepend; the thread runs next.
    pub fn push_front(&mut self, tid: DetTid) {
        self.link_check(tid);
        let old_head = self.head;
        {
            let slot = self.slot_mut(tid);
            slot.prev = None;
            slot.next = old_head;
            slot.linked = true;
        }
        match old_head {
            Some(h) => self.slot_mut(h).prev = Some(tid),
            None => self.tail = Some(tid),
        }
        self.head = Some(tid);
        self.len += 1;
        self.membership_check();
    }

    /// Insert right after the head, so `tid` runs as soon as the head is done.
    /// On an empty queue this is `push_back`.
    pub fn push_to_second(&mut self, tid: DetTid) {
        match self.head {
            Some(h) => self.insert_after(h, tid),
            None => self.push_back(tid),
        }
    }

    /// Insert `tid` immediately after the queued thread `anchor`.
    pub fn insert_after(&mut self, anchor: DetTid, tid: DetTid) {
        self.link_check(tid);
        if !self.slot(anchor).linked {
            panic!(
                "Invariant violation! Anchor {} is not queued: {}",
                anchor, self
            );
        }
        let after = self.slot(anchor).next;
        {
            let slot = self.slot_mut(tid);
            slot.prev = Some(anchor);
            slot.next = after;
            slot.linked = true;
        }
        self.slot_mut(anchor).next = Some(tid);
        match after {
            Some(a) => self.slot_mut(a).prev = Some(tid),
            None => self.tail = Some(tid),
        }
        self.len += 1;
        self.membership_check();
    }

    /// Remove and return the head.
    pub fn pop_front(&mut self) -> Option<DetTid> {
        let head = self.head?;
        self.erase(head);
        Some(head)
    }

    /// Unlink a queued thread. Removing the last element empties both ends.
    pub fn erase(&mut self, tid: DetTid) {
        let (prev, next) = {
            let slot = self.slot_mut(tid);
            if !slot.linked {
                panic!("Invariant violation! Tried to erase {}, which is not queued", tid);
            }
            let links = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            slot.linked = false;
            links
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        self.membership_check();
    }

    /// The thread that runs next, if any.
    pub fn front(&self) -> Option<DetTid> {
        self.head
    }

    /// Number of queued threads.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is nothing queued?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Is `tid` queued?
    pub fn contains(&self, tid: DetTid) -> bool {
        matches!(self.slots.get(tid.index()), Some(Some(slot)) if slot.linked)
    }

    /// Queued threads, head first.
    pub fn iter(&self) -> impl Iterator<Item = DetTid> + '_ {
        std::iter::successors(self.head, move |t| self.slot(*t).next)
    }

    /// Slots currently in `status`, in id order.
    pub fn with_status(&self, status: ThreadStatus) -> impl Iterator<Item = DetTid> + '_ {
        self.slots.iter().enumerate().filter_map(move |(ix, s)| match s {
            Some(slot) if slot.status == status => Some(DetTid::from_raw(ix as u32)),
            _ => None,
        })
    }

    /// Wipe the list and every slot. Only valid when adopting a freshly forked
    /// process image, where the parent's thread ids mean nothing.
    pub fn deep_clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// The linked ids must equal the independently tracked membership flags.
    fn membership_check(&self) {
        if cfg!(debug_assertions) {
            // Expensive.
            let mut walked = 0;
            let mut prev = None;
            for tid in self.iter() {
                let slot = self.slot(tid);
                if !slot.linked || slot.prev != prev || walked >= self.capacity() {
                    panic!(
                        "Invariant violation! Run queue links disagree with membership at {}: {:?}",
                        tid, self
                    );
                }
                prev = Some(tid);
                walked += 1;
            }
            let flagged = self
                .slots
                .iter()
                .filter(|s| matches!(s, Some(slot) if slot.linked))
                .count();
            if walked != self.len || flagged != self.len || self.tail != prev {
                panic!(
                    "Invariant violation! Run queue holds {} linked, {} flagged, len {}: {:?}",
                    walked, flagged, self.len, self
                );
            }
        }
    }
}
