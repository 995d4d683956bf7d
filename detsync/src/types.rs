/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Types shared across the runtime.

pub use detsync_model::Channel;
pub use detsync_model::DetTid;
pub use detsync_model::ExternalOp;
pub use detsync_model::InsId;
pub use detsync_model::Phase;
pub use detsync_model::SyncOp;
pub use detsync_model::TurnRecord;
use nix::errno::Errno;

/// What a hook returns: the native result, or the native error code.
pub type HookResult<T> = Result<T, Errno>;

/// Errno value to log for a hook result.
pub fn ret_code<T>(res: &HookResult<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => *e as i32,
    }
}

/// How a wait on a channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Moved back to the run queue by a signal or broadcast.
    Signaled,
    /// The deadline passed first.
    TimedOut,
}
