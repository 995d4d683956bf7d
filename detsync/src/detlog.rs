/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! DETLOG lines: the part of the diagnostic output that must be identical
//! between two runs of the same program.
//!
//! Every committed turn is echoed as one DETLOG line, and scheduler choices
//! that shape the turn order (random picks) add their own. The lines go to the
//! `detsync::detlog` target, so they can be enabled on their own, for example
//! with `RUST_LOG=detsync::detlog=info`, and diffed between runs.

/// Tracing target of every DETLOG line.
pub const DETLOG_TARGET: &str = "detsync::detlog";

/// Log a deterministic line at INFO.
#[macro_export]
macro_rules! detlog {
    ($($arg:tt)+) => {{
        tracing::info!(target: "detsync::detlog", "DETLOG {}", format!($($arg)+));
    }};
}

/// Log a deterministic line at DEBUG, for the chattier scheduler decisions.
#[macro_export]
macro_rules! detlog_debug {
    ($($arg:tt)+) => {{
        tracing::debug!(target: "detsync::detlog", "DETLOG {}", format!($($arg)+));
    }};
}
