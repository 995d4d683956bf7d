/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runtime configuration. Read once, when a runtime is created.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;

/// Configuration options for detsync.
#[derive(Debug, Serialize, Deserialize, Clone, Parser, PartialEq, Eq)]
pub struct Config {
    /// Disable turn enforcement altogether. Hooks then behave like the native
    /// primitives they replace and nothing is logged.
    #[clap(long = "no-deterministic", parse(from_flag = std::ops::Not::not))]
    pub deterministic: bool,

    /// Ignore non-deterministic region annotations, keeping the annotated
    /// code under turn enforcement.
    #[clap(
        long = "no-enforce-nondet-annotations",
        parse(from_flag = std::ops::Not::not)
    )]
    pub enforce_nondet_annotations: bool,

    /// Directory that receives the turn log, one file per process. When
    /// absent the log is kept in memory.
    #[clap(long, env = "DETSYNC_LOG_DIR", value_name = "dir")]
    pub log_dir: Option<PathBuf>,

    /// Do not record synchronization operations in the turn log.
    #[clap(long = "no-log-sync", parse(from_flag = std::ops::Not::not))]
    pub log_sync: bool,

    /// Count operations per category and report them when the program ends.
    #[clap(long)]
    pub record_runtime_stat: bool,

    /// How the next turn holder is picked from the run queue.
    #[clap(long, default_value = "roundrobin", value_name = "heuristic")]
    pub sched_heuristic: SchedHeuristic,

    /// Seed for the `random` scheduling heuristic.
    #[clap(
        long,
        env = "DETSYNC_SCHED_SEED",
        default_value = "0",
        value_name = "uint64"
    )]
    pub sched_seed: u64,

    /// Wall-clock nanoseconds represented by one turn when converting the
    /// timeouts of timed operations.
    #[clap(long, default_value = "1000000", value_name = "ns")]
    pub nanos_per_turn: u64,

    /// Largest number of threads the runtime can track over its lifetime.
    #[clap(long, default_value = "2000", value_name = "n")]
    pub max_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["detsync"])
    }
}

impl Config {
    /// Read a config from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let file = File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let cfg = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Config from the environment only: every option at its default unless
    /// overridden by its environment variable.
    pub fn from_env() -> Config {
        Config::default()
    }
}

/// Strategy for choosing which runnable thread receives the turn next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchedHeuristic {
    /// Hand the turn to the head of the run queue.
    RoundRobin,
    /// Randomly pick any runnable thread, from a seeded PRNG.
    Random,
}

impl Default for SchedHeuristic {
    fn default() -> Self {
        SchedHeuristic::RoundRobin
    }
}

impl FromStr for SchedHeuristic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "roundrobin" => Ok(SchedHeuristic::RoundRobin),
            "random" => Ok(SchedHeuristic::Random),
            _ => Err(format!("Unknown scheduling heuristic: {}", s)),
        }
    }
}
