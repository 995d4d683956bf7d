/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identifiers: deterministic thread ids, instrumentation sites, and wait channels.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Dense, deterministic identifier of a monitored thread. The main thread is
/// always zero; every other thread receives the next id at creation time.
#[derive(
    PartialEq, // Silly protection from rustfmt disagreements.
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
pub struct DetTid(u32);

impl DetTid {
    /// The id of the thread that started the runtime.
    pub const MAIN: DetTid = DetTid(0);

    /// Create a DetTid from a raw id.
    pub const fn from_raw(id: u32) -> DetTid {
        DetTid(id)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> u32 {
        self.0
    }

    /// Position of this thread's slot in fixed-capacity, id-indexed tables.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DetTid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DetTid {
    type Err = <u32 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s.parse::<u32>()?))
    }
}

/// Opaque identifier of the call site that invoked a hook. It annotates the
/// turn log and never influences scheduling.
#[derive(
    PartialEq,
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
pub struct InsId(u32);

impl InsId {
    /// Used by hooks issued from inside the runtime itself.
    pub const RUNTIME: InsId = InsId(u32::MAX);

    /// Create a site id.
    pub const fn new(id: u32) -> InsId {
        InsId(id)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InsId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if *self == InsId::RUNTIME {
            write!(f, "rt")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// The families of keys threads may wait on. Keys from different domains
/// never collide, even when their numeric values are equal.
#[derive(
    PartialEq,
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDomain {
    /// The address of an emulated synchronization object.
    Sync,
    /// Exit of the thread with the given id; joiners wait here.
    ThreadExit,
    /// Arrival at a lineup group.
    LineupArrive,
    /// Late arrivals waiting for a lineup's next round.
    LineupRound,
    /// Private channel of a deterministic sleeper. Nothing signals it.
    Sleep,
}

/// A wait channel: an opaque key associating waiters with wakers. It owns no
/// data and is compared by identity only.
#[derive(
    PartialEq,
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct Channel {
    domain: ChannelDomain,
    key: u64,
}

impl Channel {
    /// Channel of the synchronization object at `addr`.
    pub const fn sync(addr: usize) -> Channel {
        Channel {
            domain: ChannelDomain::Sync,
            key: addr as u64,
        }
    }

    /// Channel signaled when `tid` exits.
    pub const fn thread_exit(tid: DetTid) -> Channel {
        Channel {
            domain: ChannelDomain::ThreadExit,
            key: tid.0 as u64,
        }
    }

    /// Channel on which members of lineup `id` wait for the group to fill.
    pub const fn lineup_arrive(id: usize) -> Channel {
        Channel {
            domain: ChannelDomain::LineupArrive,
            key: id as u64,
        }
    }

    /// Channel on which late arrivals to lineup `id` wait for the next round.
    pub const fn lineup_round(id: usize) -> Channel {
        Channel {
            domain: ChannelDomain::LineupRound,
            key: id as u64,
        }
    }

    /// Private sleep channel of `tid`.
    pub const fn sleep(tid: DetTid) -> Channel {
        Channel {
            domain: ChannelDomain::Sleep,
            key: tid.0 as u64,
        }
    }

    /// Which family this key belongs to.
    pub fn domain(&self) -> ChannelDomain {
        self.domain
    }

    /// The raw key within the domain.
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.domain {
            ChannelDomain::Sync => write!(f, "sync:{:#x}", self.key),
            ChannelDomain::ThreadExit => write!(f, "exit:{}", self.key),
            ChannelDomain::LineupArrive => write!(f, "lineup:{:#x}", self.key),
            ChannelDomain::LineupRound => write!(f, "lineup-round:{:#x}", self.key),
            ChannelDomain::Sleep => write!(f, "sleep:{}", self.key),
        }
    }
}

/// The address of an object, used as its identity in the hook surface.
pub fn addr_of<T>(obj: &T) -> usize {
    obj as *const T as usize
}
