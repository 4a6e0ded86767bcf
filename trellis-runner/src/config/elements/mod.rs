// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration elements for trellis.

mod parallel;
mod poll_progress;
mod retry_policy;

pub use parallel::*;
pub use poll_progress::*;
pub use retry_policy::*;
