/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The turn log: one record per committed turn, in turn order.
//!
//! Records go either to memory, or to `turns.<pid>.jsonl` under the configured
//! directory, one JSON object per line. A process image created by fork
//! continues in a file of its own.
//!
//! The in-memory log serves tests and short runs. It keeps only the most
//! recent [`MEMORY_LOG_CAPACITY`] records; long runs should log to a
//! directory.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use detsync_model::Config;
use tracing::error;
use tracing::warn;

use crate::detlog;
use crate::types::TurnRecord;

/// Records an in-memory log holds before it starts dropping the oldest.
pub const MEMORY_LOG_CAPACITY: usize = 1 << 20;

#[derive(Debug)]
enum Sink {
    Memory {
        recs: VecDeque<TurnRecord>,
        capacity: usize,
        dropped: u64,
    },
    File {
        dir: PathBuf,
        path: PathBuf,
        out: BufWriter<File>,
    },
    /// Writing failed; later records are dropped.
    Broken,
}

#[derive(Debug)]
pub struct TurnLog {
    enabled: bool,
    sink: Sink,
}

fn log_path(dir: &Path) -> PathBuf {
    dir.join(format!("turns.{}.jsonl", std::process::id()))
}

fn create(dir: &Path) -> anyhow::Result<(PathBuf, BufWriter<File>)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating turn log directory {}", dir.display()))?;
    let path = log_path(dir);
    let file =
        File::create(&path).with_context(|| format!("creating turn log {}", path.display()))?;
    Ok((path, BufWriter::new(file)))
}

impl TurnLog {
    /// A log kept in memory. Disabled logs record nothing.
    pub fn in_memory(enabled: bool) -> Self {
        Self::in_memory_bounded(enabled, MEMORY_LOG_CAPACITY)
    }

    fn in_memory_bounded(enabled: bool, capacity: usize) -> Self {
        TurnLog {
            enabled,
            sink: Sink::Memory {
                recs: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            },
        }
    }

    /// The log `cfg` asks for.
    pub fn open(cfg: &Config) -> anyhow::Result<Self> {
        match &cfg.log_dir {
            Some(dir) if cfg.log_sync => {
                let (path, out) = create(dir)?;
                Ok(TurnLog {
                    enabled: true,
                    sink: Sink::File {
                        dir: dir.clone(),
                        path,
                        out,
                    },
                })
            }
            _ => Ok(TurnLog::in_memory(cfg.log_sync)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// File backing the log, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::File { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn append(&mut self, rec: TurnRecord) {
        if !self.enabled {
            return;
        }
        detlog!("{}", rec);
        match &mut self.sink {
            Sink::Memory {
                recs,
                capacity,
                dropped,
            } => {
                if recs.len() == *capacity {
                    if *dropped == 0 {
                        warn!(
                            "In-memory turn log is full at {} records, dropping the oldest",
                            capacity
                        );
                    }
                    recs.pop_front();
                    *dropped += 1;
                }
                recs.push_back(rec);
            }
            Sink::File { path, out, .. } => {
                let res = serde_json::to_writer(&mut *out, &rec)
                    .map_err(anyhow::Error::from)
                    .and_then(|()| out.write_all(b"\n").map_err(anyhow::Error::from));
                if let Err(e) = res {
                    error!(
                        "Turn log {} failed, dropping further records: {:#}",
                        path.display(),
                        e
                    );
                    self.sink = Sink::Broken;
                }
            }
            Sink::Broken => {}
        }
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if let Sink::File { path, out, .. } = &mut self.sink {
            out.flush()
                .with_context(|| format!("flushing turn log {}", path.display()))?;
        }
        Ok(())
    }

    /// Records kept in memory, oldest first. Empty for file-backed logs.
    pub fn records(&self) -> Vec<TurnRecord> {
        match &self.sink {
            Sink::Memory { recs, .. } => recs.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Records an in-memory log had to drop for lack of room.
    pub fn dropped(&self) -> u64 {
        match &self.sink {
            Sink::Memory { dropped, .. } => *dropped,
            _ => 0,
        }
    }

    /// In a forked child: stop sharing the parent's log. In-memory records
    /// are forgotten, a file-backed log switches to the child's own file.
    /// Bytes the parent had buffered at the fork belong to the parent and are
    /// dropped here unwritten.
    pub fn reopen_for_child(&mut self) {
        match std::mem::replace(&mut self.sink, Sink::Broken) {
            Sink::Memory { capacity, .. } => {
                self.sink = Sink::Memory {
                    recs: VecDeque::new(),
                    capacity,
                    dropped: 0,
                }
            }
            Sink::File { dir, out, .. } => {
                let (_parent_file, _parent_bytes) = out.into_parts();
                self.sink = match create(&dir) {
                    Ok((path, out)) => Sink::File { dir, path, out },
                    Err(e) => {
                        error!("Cannot reopen turn log in forked child: {:#}", e);
                        Sink::Broken
                    }
                };
            }
            Sink::Broken => {}
        }
    }
}

/// Parse a turn log written to disk.
pub fn read_turn_log(path: &Path) -> anyhow::Result<Vec<TurnRecord>> {
    let file =
        File::open(path).with_context(|| format!("opening turn log {}", path.display()))?;
    let mut recs = Vec::new();
    for (ix, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading turn log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let rec = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed turn record", path.display(), ix + 1))?;
        recs.push(rec);
    }
    Ok(recs)
}
