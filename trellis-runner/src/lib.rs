// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Execution engine for trellis, a behavior-driven spec framework.
//!
//! The basic flow of operations:
//!
//! 1. Describe a suite with a [`SuiteBuilder`](tree::SuiteBuilder): containers, specs and their
//!    setup and teardown hooks. Decorator misuse is reported when the suite is built.
//! 2. Load a [`SuiteConfig`](config::SuiteConfig), from defaults, a config file and the
//!    environment.
//! 3. Build a [`SuiteRunner`](runner::SuiteRunner) with a
//!    [`SuiteRunnerBuilder`](runner::SuiteRunnerBuilder). This resolves the spec list, applies
//!    focus and filters and orders the specs into scheduling units.
//! 4. Call [`SuiteRunner::execute`](runner::SuiteRunner::execute). Events stream to the callback
//!    as they happen, and the run ends with a [`SuiteReport`](reporter::SuiteReport).
//!
//! Parallel runs start the same suite in several processes and connect them through the
//! [`parallel`] module.

pub mod config;
pub mod errors;
mod helpers;
pub mod list;
pub mod output;
pub mod parallel;
pub mod progress;
pub mod reporter;
pub mod runner;
pub mod signal;
pub mod test_filter;
mod time;
pub mod tree;
