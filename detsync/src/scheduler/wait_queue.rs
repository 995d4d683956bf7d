/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Threads parked on wait channels.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::types::Channel;
use crate::types::DetTid;

/// Per-channel FIFO queues of parked threads.
#[derive(Debug, Clone, Default)]
pub struct WaitQueue {
    // Inner queues are always non-empty:
    channels: BTreeMap<Channel, VecDeque<DetTid>>,
    parked: BTreeMap<DetTid, Channel>,
}

impl WaitQueue {
    /// Record `tid` as parked on `chan`, behind every earlier waiter.
    pub fn park(&mut self, tid: DetTid, chan: Channel) {
        if let Some(old) = self.parked.insert(tid, chan) {
            panic!(
                "Invariant violation! {} parked on {} while already parked on {}",
                tid, chan, old
            );
        }
        self.channels.entry(chan).or_default().push_back(tid);
    }

    /// Remove the oldest waiter on `chan`, or all of them, in parking order.
    pub fn take(&mut self, chan: Channel, all: bool) -> Vec<DetTid> {
        let mut woken = Vec::new();
        if let Some(queue) = self.channels.get_mut(&chan) {
            if all {
                woken.extend(queue.drain(..));
            } else if let Some(first) = queue.pop_front() {
                woken.push(first);
            }
            if queue.is_empty() {
                self.channels.remove(&chan);
            }
        }
        for tid in &woken {
            self.parked.remove(tid);
        }
        woken
    }

    /// Remove a specific waiter, e.g. on timeout. Returns its channel.
    pub fn remove(&mut self, tid: DetTid) -> Option<Channel> {
        let chan = self.parked.remove(&tid)?;
        let emptied = match self.channels.get_mut(&chan) {
            Some(queue) => {
                queue.retain(|t| *t != tid);
                queue.is_empty()
            }
            None => false,
        };
        if emptied {
            self.channels.remove(&chan);
        }
        Some(chan)
    }

    /// The channel `tid` is parked on, if any.
    pub fn channel_of(&self, tid: DetTid) -> Option<Channel> {
        self.parked.get(&tid).copied()
    }

    /// Number of parked threads on `chan`.
    pub fn waiting_on(&self, chan: Channel) -> usize {
        self.channels.get(&chan).map_or(0, |q| q.len())
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.parked.clear();
    }

    /// Parked threads with their channels, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (DetTid, Channel)> + '_ {
        self.parked.iter().map(|(t, c)| (*t, *c))
    }
}
