/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The turn log entry format. This is the artifact consumed by trace
//! analyzers after execution, so changes here are wire-format changes.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::ids::DetTid;
use crate::ids::InsId;

/// A blocking call on an event outside scheduler control.
#[derive(PartialEq, Debug, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalOp {
    Accept,
    Connect,
    Recv,
    Send,
    Read,
    Write,
    Select,
    Poll,
    EpollWait,
    Other,
}

/// Every operation that can appear in the turn log.
#[derive(PartialEq, Debug, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    ThreadBegin,
    ThreadEnd,
    ThreadCreate,
    ThreadJoin,
    Fork,
    MutexInit,
    MutexLock,
    MutexTryLock,
    MutexTimedLock,
    MutexUnlock,
    MutexDestroy,
    CondInit,
    CondWait,
    CondTimedWait,
    CondSignal,
    CondBroadcast,
    CondDestroy,
    BarrierInit,
    BarrierWait,
    BarrierDestroy,
    SemInit,
    SemWait,
    SemTryWait,
    SemTimedWait,
    SemPost,
    SemGetValue,
    SemDestroy,
    RwLockInit,
    RwLockRdLock,
    RwLockWrLock,
    RwLockTryRdLock,
    RwLockTryWrLock,
    RwLockUnlock,
    RwLockDestroy,
    SchedYield,
    Sleep,
    LineupInit,
    LineupStart,
    LineupEnd,
    LineupDestroy,
    NonDetStart,
    NonDetEnd,
    NonDetBarrierEnd,
    External(ExternalOp),
}

impl fmt::Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyncOp::External(op) => write!(f, "External({:?})", op),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Which half of an operation a record describes. Operations that give up the
/// turn in the middle (condition wait, barrier wait) log their first half
/// before parking and the completion after they resume.
#[derive(PartialEq, Debug, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// First half of a two-part operation.
    Partial,
    /// The operation took effect.
    Complete,
}

/// One line of the turn log.
#[derive(PartialEq, Debug, Eq, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Value of the turn counter this operation consumed.
    pub turn: u64,
    /// The thread that held the turn.
    pub tid: DetTid,
    /// What happened.
    pub op: SyncOp,
    /// First or final half.
    pub phase: Phase,
    /// Call site.
    pub ins: InsId,
    /// Operation arguments, typically object addresses and counts.
    pub args: Vec<u64>,
    /// Zero on success, otherwise the errno returned to the caller.
    pub ret: i32,
    /// [Nondeterministic] When the hook was entered.
    pub call_time: DateTime<Utc>,
    /// [Nondeterministic] When the record was taken.
    pub return_time: DateTime<Utc>,
}

impl TurnRecord {
    /// The deterministic portion of the record: everything except timestamps.
    /// Two runs of the same program with the same inputs produce identical
    /// keys in identical order.
    pub fn det_key(&self) -> (u64, DetTid, SyncOp, Phase, InsId, &[u64], i32) {
        (
            self.turn,
            self.tid,
            self.op,
            self.phase,
            self.ins,
            &self.args,
            self.ret,
        )
    }
}

/// Prints only the deterministic fields.
impl fmt::Display for TurnRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[turn {}] tid {} {}", self.turn, self.tid, self.op)?;
        if self.phase == Phase::Partial {
            write!(f, "(first)")?;
        }
        write!(f, " ins {} args [", self.ins)?;
        for (ix, a) in self.args.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:#x}", a)?;
        }
        write!(f, "] = {}", self.ret)
    }
}
