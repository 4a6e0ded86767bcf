// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite configuration.
//!
//! Configuration is layered: the defaults in `default-config.toml`, then an optional TOML file,
//! then the parallel launcher's environment variables.

mod elements;
mod imp;

pub use elements::*;
pub use imp::*;
