// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite runner.
//!
//! The main structure in this module is [`SuiteRunner`].

mod context;
mod executor;
mod imp;
mod retry;
mod supervisor;

pub use context::SpecContext;
pub use imp::*;
pub use supervisor::AbortHandle;
