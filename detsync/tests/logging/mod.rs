/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The turn log on disk and in the DETLOG stream.

use detsync::read_turn_log;
use detsync::types::InsId;
use detsync::types::SyncOp;
use detsync::Config;
use detsync_testutils::run_once;
use detsync_testutils::run_with_logs;
use detsync_testutils::BOTTOM_CFG;
use pretty_assertions::assert_eq;

const INS: InsId = InsId::new(11);
const M: usize = 0x1000;

#[test]
fn log_file_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = Config {
        log_dir: Some(dir.path().to_path_buf()),
        ..BOTTOM_CFG.clone()
    };
    let out = run_once(&cfg, |rt| {
        rt.mutex_init(INS, M).unwrap();
        rt.mutex_lock(INS, M).unwrap();
        rt.mutex_unlock(INS, M).unwrap();
    });
    // File-backed logs keep nothing in memory.
    assert!(out.records.is_empty());
    let path = out.summary.log_path.expect("log file");
    assert!(path.starts_with(dir.path()));
    let recs = read_turn_log(&path)?;
    let ops: Vec<_> = recs.iter().map(|r| r.op).collect();
    assert_eq!(
        ops,
        vec![
            SyncOp::ThreadBegin,
            SyncOp::MutexInit,
            SyncOp::MutexLock,
            SyncOp::MutexUnlock,
            SyncOp::ThreadEnd,
        ]
    );
    assert!(recs.iter().all(|r| r.ins == INS || r.ins == InsId::RUNTIME));
    assert!(recs.iter().all(|r| r.call_time <= r.return_time));
    assert_eq!(recs[2].args, vec![M as u64]);
    Ok(())
}

#[test]
fn records_are_mirrored_as_detlog_lines() {
    let (out, logs) = run_with_logs(BOTTOM_CFG.clone(), |rt| {
        rt.sched_yield(INS);
    });
    assert_eq!(out.detlogs.len(), out.records.len());
    assert_eq!(out.detlogs[1], out.records[1].to_string());
    assert!(logs.iter().any(|l| l.contains("Program ends")));
    assert!(logs
        .iter()
        .filter(|l| l.contains("DETLOG "))
        .all(|l| l.contains(detsync::detlog::DETLOG_TARGET)));
}

#[test]
fn disabled_log_records_nothing() {
    let cfg = Config {
        log_sync: false,
        ..BOTTOM_CFG.clone()
    };
    let out = run_once(&cfg, |rt| {
        rt.mutex_lock(INS, M).unwrap();
    });
    assert!(out.records.is_empty());
    assert!(out.detlogs.is_empty());
    // Turns are still taken.
    assert_eq!(out.summary.turns, 3);
}
