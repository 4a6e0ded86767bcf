// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Coordination between the processes of a parallel run.
//!
//! Process 1 is the primary. Every process runs the same suite and claims scheduling units from a
//! shared [`ParallelServer`], so each unit runs exactly once. The server also distributes the
//! synchronized before-suite payload, relays aborts and collects reports for the primary to merge.

mod client;
mod server;
mod tcp;

pub use client::{LocalClient, ParallelClient, ParallelSession};
pub(crate) use client::Coordinator;
pub use server::{ParallelServer, Request, Response};
pub use tcp::{TcpClient, serve};
