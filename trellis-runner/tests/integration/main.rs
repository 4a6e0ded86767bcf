// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod basic;
mod config;
mod fixtures;
mod interrupts;
mod ordered;
mod output;
mod parallel;
