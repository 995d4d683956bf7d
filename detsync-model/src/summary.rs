/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Summaries of complete monitored runs.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// Per-category operation counts, collected when `record_runtime_stat` is set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Synchronization operations performed under the turn.
    pub det_sync_ops: u64,
    /// Blocking calls on external events (block/wakeup pairs).
    pub external_ops: u64,
    /// Non-deterministic regions entered.
    pub nondet_regions: u64,
    /// Synchronization operations performed inside non-deterministic regions.
    pub nondet_sync_ops: u64,
    /// Lineup rounds that filled before their timeout.
    pub lineup_success: u64,
    /// Lineup rounds that ran partially after a timeout.
    pub lineup_timeout: u64,
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let RuntimeStats {
            det_sync_ops,
            external_ops,
            nondet_regions,
            nondet_sync_ops,
            lineup_success,
            lineup_timeout,
        } = self;
        writeln!(
            f,
            "{} deterministic sync ops, {} external blocking ops",
            det_sync_ops, external_ops
        )?;
        writeln!(
            f,
            "{} non-det regions containing {} sync ops",
            nondet_regions, nondet_sync_ops
        )?;
        writeln!(
            f,
            "{} lineup rounds succeeded, {} timed out",
            lineup_success, lineup_timeout
        )
    }
}

/// Statistics that summarize a run, returned when the program ends.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RunSummary {
    /// Final value of the turn counter.
    pub turns: u64,
    /// Threads registered over the run, the main thread included.
    pub threads: u64,
    /// Number of non-deterministic region entries.
    pub nondet_entered: u64,
    /// Number of non-deterministic region exits, barrier exits included.
    pub nondet_exited: u64,
    /// Where the turn log was written, when it went to disk.
    pub log_path: Option<PathBuf>,
    /// Category counts, when they were recorded.
    pub stats: Option<RuntimeStats>,
}

/// A human-readable, multi-line summary.
impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "The scheduler ran {} turns across {} thread(s).",
            self.turns, self.threads
        )?;
        writeln!(
            f,
            "Non-det regions: {} entered, {} exited.",
            self.nondet_entered, self.nondet_exited
        )?;
        if let Some(path) = &self.log_path {
            writeln!(f, "Turn log written to {}", path.display())?;
        }
        if let Some(stats) = &self.stats {
            write!(f, "{}", stats)?;
        }
        Ok(())
    }
}
