// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolution of a suite into a flat list of specs, and the order they run in.
//!
//! [`SpecList`] is pure: it never invokes node bodies, so it backs both real runs and previews.

mod ordering;
mod spec_list;

pub use ordering::*;
pub use spec_list::*;
