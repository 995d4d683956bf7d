/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Widely-shared type definitions for the detsync runtime and the tools that
//! consume its turn log.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod ids;
pub mod record;
pub mod summary;

pub use config::Config;
pub use config::SchedHeuristic;
pub use ids::Channel;
pub use ids::ChannelDomain;
pub use ids::DetTid;
pub use ids::InsId;
pub use ids::addr_of;
pub use record::ExternalOp;
pub use record::Phase;
pub use record::SyncOp;
pub use record::TurnRecord;
pub use summary::RunSummary;
pub use summary::RuntimeStats;
