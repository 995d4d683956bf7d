/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Detsync makes the synchronization of a multithreaded program happen in the
//! same order on every run.
//!
//! Threads take turns. Each synchronization operation waits for the calling
//! thread's turn, takes effect, consumes one value of a global turn counter and
//! passes the turn on. The resulting sequence of turns is recorded in the turn
//! log and is identical between runs given the same external inputs.
//!
//! Instrumented code calls the [`SyncHooks`] of a [`Runtime`] instead of the
//! native primitives, and spawns and joins threads through it.

#![allow(clippy::uninlined_format_args)]

mod lineup;
mod nondet;
mod registry;
mod scheduler;

pub mod detlog;
pub mod hooks;
pub mod native;
pub mod runtime;
pub mod sync;
pub mod thread;
pub mod turn_log;
pub mod types;

use std::ops::Deref;
use std::sync::Arc;

pub use detsync_model::Config;
pub use detsync_model::RunSummary;
pub use detsync_model::RuntimeStats;
pub use detsync_model::SchedHeuristic;
pub use hooks::SyncHooks;
pub use native::NativeRuntime;
use nix::unistd::ForkResult;
pub use runtime::DetRuntime;
pub use sync::barrier::BarrierWaitResult;
pub use thread::JoinHandle;
use tracing::info;
pub use turn_log::read_turn_log;
use types::ExternalOp;
use types::InsId;
use types::TurnRecord;

/// Error type for setting up and tearing down a runtime.
pub type Error = anyhow::Error;

/// Result of setting up and tearing down a runtime.
pub type Result<T> = anyhow::Result<T>;

/// A runtime, deterministic or not, chosen by [`Config::deterministic`].
#[derive(Debug, Clone)]
pub enum Runtime {
    /// Every operation takes a turn.
    Deterministic(Arc<DetRuntime>),
    /// Operations behave natively.
    Native(Arc<NativeRuntime>),
}

impl Runtime {
    /// progBegin: start monitoring the process. The calling thread becomes the
    /// main thread.
    pub fn prog_begin(cfg: Config) -> Result<Runtime> {
        if cfg.deterministic {
            Ok(Runtime::Deterministic(DetRuntime::new(cfg)?))
        } else {
            info!("Program begins without deterministic scheduling");
            Ok(Runtime::Native(Arc::new(NativeRuntime::new())))
        }
    }

    /// progEnd: called by the main thread once it is done.
    pub fn prog_end(&self) -> Result<RunSummary> {
        match self {
            Runtime::Deterministic(rt) => rt.prog_end(),
            Runtime::Native(_) => Ok(RunSummary::default()),
        }
    }

    /// Whether operations take turns.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Runtime::Deterministic(_))
    }

    /// Start `f` on a new thread managed by this runtime.
    pub fn spawn<F, T>(&self, ins: InsId, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Runtime::Deterministic(rt) => thread::spawn(rt, ins, f),
            Runtime::Native(_) => JoinHandle::native(std::thread::spawn(f)),
        }
    }

    /// Run `f`, which may block on an event outside the runtime's control.
    pub fn external<R>(&self, ins: InsId, op: ExternalOp, f: impl FnOnce() -> R) -> R {
        match self {
            Runtime::Deterministic(rt) => rt.external(ins, op, f),
            Runtime::Native(_) => f(),
        }
    }

    /// Turn log records kept in memory.
    pub fn records(&self) -> Vec<TurnRecord> {
        match self {
            Runtime::Deterministic(rt) => rt.records(),
            Runtime::Native(_) => Vec::new(),
        }
    }

    /// Fork the process. Under deterministic scheduling, the child starts a
    /// fresh schedule with the calling thread as its only thread.
    ///
    /// # Safety
    ///
    /// See [`nix::unistd::fork`].
    pub unsafe fn fork(&self, ins: InsId) -> nix::Result<ForkResult> {
        match self {
            Runtime::Deterministic(rt) => thread::fork(rt, ins),
            Runtime::Native(_) => nix::unistd::fork(),
        }
    }
}

impl Deref for Runtime {
    type Target = dyn SyncHooks;

    fn deref(&self) -> &Self::Target {
        match self {
            Runtime::Deterministic(rt) => rt.as_ref(),
            Runtime::Native(rt) => rt.as_ref(),
        }
    }
}
