/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Testing utilities.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use detsync::types::TurnRecord;
use detsync::Config;
use detsync::RunSummary;
use detsync::Runtime;
use detsync::SchedHeuristic;
use lazy_static::lazy_static;
use pretty_assertions::assert_eq;
use tracing_subscriber::fmt::MakeWriter;

/// How many runs for each test when confirming determinism.
static TEST_REPS: u64 = 3;

lazy_static! {
  static ref DEFAULT_CFG: Config = Default::default();

  /// Standardized test config: all options off.
  pub static ref BOTTOM_CFG: Config = Config {
    deterministic: true,
    enforce_nondet_annotations: false,
    log_dir: None,
    log_sync: true,
    record_runtime_stat: false,
    sched_heuristic: SchedHeuristic::RoundRobin,
    sched_seed: DEFAULT_CFG.sched_seed,
    nanos_per_turn: DEFAULT_CFG.nanos_per_turn,
    max_threads: 64,
  };

  /// Standardized test config: all options on.
  pub static ref TOP_CFG: Config = Config {
    deterministic: true,
    enforce_nondet_annotations: true,
    log_dir: None,
    log_sync: true,
    record_runtime_stat: true,
    sched_heuristic: SchedHeuristic::Random,
    sched_seed: 12345,
    nanos_per_turn: DEFAULT_CFG.nanos_per_turn,
    max_threads: 64,
  };
}

/// Everything one run of a test produced.
#[derive(Debug)]
pub struct RunOutput {
    /// Turn log records, in turn order.
    pub records: Vec<TurnRecord>,
    /// What progEnd reported.
    pub summary: RunSummary,
    /// DETLOG lines, stripped of timestamps and thread names.
    pub detlogs: Vec<String>,
}

struct BufWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Clone for BufWriter {
    fn clone(&self) -> Self {
        BufWriter {
            buf: self.buf.clone(),
        }
    }
}

impl BufWriter {
    fn new() -> BufWriter {
        BufWriter {
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn buf(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap()
    }

    fn get_strings(&self) -> Vec<String> {
        let mut b = self.buf();
        let s = String::from_utf8_lossy(&b[..]).to_string();
        b.clear();
        s.lines().map(String::from).collect()
    }
}

impl io::Write for BufWriter {
    fn write(&mut self, msg: &[u8]) -> io::Result<usize> {
        self.buf().write(msg)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.buf().flush()
    }
}

impl MakeWriter<'_> for BufWriter {
    type Writer = BufWriter;

    fn make_writer(&self) -> Self::Writer {
        BufWriter {
            buf: self.buf.clone(),
        }
    }
}

/// Run `f` on a fresh runtime as its main thread, capturing the logs.
pub fn run_with_logs<F>(config: Config, f: F) -> (RunOutput, Vec<String>)
where
    F: FnOnce(&Runtime),
{
    let trace_level =
        std::env::var("DETSYNC_TEST_RUST_LOG").unwrap_or_else(|_| "detsync=info".into());
    let bufwriter = BufWriter::new();
    let collector = tracing_subscriber::fmt()
        .with_env_filter(trace_level)
        .with_writer(bufwriter.clone())
        .finish();

    // Keep the collector scoped to this run so that only its output is captured.
    let (records, summary) = tracing::subscriber::with_default(collector, || {
        let rt = Runtime::prog_begin(config).unwrap();
        f(&rt);
        let summary = rt.prog_end().unwrap();
        (rt.records(), summary)
    });
    let logs = bufwriter.get_strings();
    let detlogs = logs
        .iter()
        .filter_map(|l| l.split_once("DETLOG ").map(|(_, rest)| rest.to_string()))
        .collect();
    (
        RunOutput {
            records,
            summary,
            detlogs,
        },
        logs,
    )
}

/// Run `f` once on a fresh runtime with `config`.
pub fn run_once<F>(config: &Config, f: F) -> RunOutput
where
    F: FnOnce(&Runtime),
{
    run_with_logs(config.clone(), f).0
}

/// Runs a function multiple times, each on a fresh runtime, and checks that
/// the turn logs are identical. Returns the output of the last run.
pub fn det_test_fn<F>(config: &Config, f: F) -> RunOutput
where
    F: Fn(&Runtime),
{
    let mut last: Option<RunOutput> = None;
    for ix in 1..=TEST_REPS {
        println!("Test Run {}:", ix);
        let out = run_once(config, &f);
        println!("({} turn records.)", out.records.len());
        if let Some(prev) = &last {
            check_output(prev, &out);
        }
        last = Some(out);
    }
    last.expect("at least one run")
}

/// Checks that two runs made the same decisions.
fn check_output(a: &RunOutput, b: &RunOutput) {
    let keys_a: Vec<_> = a.records.iter().map(|r| r.det_key()).collect();
    let keys_b: Vec<_> = b.records.iter().map(|r| r.det_key()).collect();
    assert_eq!(
        keys_a, keys_b,
        "\n  Consecutive runs of test had different turn logs"
    );
    assert_eq!(
        a.detlogs, b.detlogs,
        "\n  Consecutive runs of test had different DETLOG lines"
    );
    assert_eq!(a.summary.turns, b.summary.turns);
}

/// The turn log as `(tid, op)` pairs, for compact assertions.
pub fn ops(records: &[TurnRecord]) -> Vec<(u32, String)> {
    records
        .iter()
        .map(|r| {
            let op = if r.phase == detsync::types::Phase::Partial {
                format!("{}(first)", r.op)
            } else {
                r.op.to_string()
            };
            (r.tid.as_raw(), op)
        })
        .collect()
}
