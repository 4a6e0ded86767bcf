// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reports on the results of a suite run.
//!
//! Events are streamed to the caller as specs finish, and accumulated into a [`SuiteReport`] by a
//! [`ReportAggregator`].

mod aggregator;
mod events;

pub use aggregator::*;
pub use events::*;
