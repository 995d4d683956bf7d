/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::types::DetTid;

/// The set of parked threads whose waits expire at a given turn.
///
/// Several threads may share a deadline; within one deadline they fire in id order.
#[derive(Debug, Clone, Default)]
pub struct TimedWaiters {
    // Inner set is always non-empty:
    map: BTreeMap<u64, BTreeSet<DetTid>>,
    deadlines: BTreeMap<DetTid, u64>,
}

impl TimedWaiters {
    pub fn insert(&mut self, deadline: u64, dt: DetTid) {
        if self.deadlines.insert(dt, deadline).is_some() {
            panic!(
                "TimedWaiters::insert should not take a DetTid which is *already* waiting: {}",
                dt
            );
        }
        self.map.entry(deadline).or_default().insert(dt);
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Are no timed waits outstanding?
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// The earliest deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }

    /// Return the next waiter whose deadline is strictly before `turn`.
    /// Being a "pop", this destructively removes the entry.
    pub fn pop_expired(&mut self, turn: u64) -> Option<(u64, DetTid)> {
        let mut entry = self.map.first_entry()?;
        let deadline = *entry.key();
        if deadline >= turn {
            return None;
        }
        let set = entry.get_mut();
        let dettid = set.pop_first().expect("inner set cannot be empty");
        if set.is_empty() {
            entry.remove();
        }
        self.deadlines.remove(&dettid);
        Some((deadline, dettid))
    }

    /// Remove a specific thread, e.g. because it was signaled before its deadline.
    pub fn remove(&mut self, dettid: DetTid) -> Option<u64> {
        let deadline = self.deadlines.remove(&dettid)?;
        let emptied = match self.map.get_mut(&deadline) {
            Some(set) => {
                set.remove(&dettid);
                set.is_empty()
            }
            None => panic!(
                "invariant violation: deadline {} of {} has no TimedWaiters entry",
                deadline, dettid
            ),
        };
        if emptied {
            self.map.remove(&deadline);
        }
        Some(deadline)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.deadlines.clear();
    }

    /// Iterate over the entries in deadline order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, DetTid)> + '_ {
        self.map
            .iter()
            .flat_map(|(key, set)| set.iter().map(move |dtid| (*key, *dtid)))
    }
}
