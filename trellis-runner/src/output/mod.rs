// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capture of output produced while a spec runs.
//!
//! Output written through a [`SpecWriter`] is always buffered while capture is active. With
//! [`CaptureStrategy::Streams`] the process's stdout and stderr are redirected into the same
//! buffer.

#[cfg(unix)]
mod unix;

use crate::helpers::lock;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Appended to captured output when stdout and stderr are still held open by another process
/// once a node finishes.
pub const BAILOUT_MESSAGE: &str = "\
trellis stopped waiting for captured stdout and stderr to close.
They are still held open by another process, most likely one spawned with inherited stdio that
outlived the spec. Output written after this point is discarded. Give the child process its own
stdout and stderr, or wait for it to exit before the spec ends.
";

/// How output produced by specs is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureStrategy {
    /// Nothing is captured. Writer output goes straight to stdout.
    None,

    /// Only output written through a [`SpecWriter`] is captured.
    WriterOnly,

    /// Writer output and the process's stdout and stderr are captured.
    Streams,
}

impl Default for CaptureStrategy {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                Self::Streams
            } else {
                Self::WriterOnly
            }
        }
    }
}

/// Collects the output of the running node.
///
/// Cloning produces another handle to the same interceptor.
#[derive(Clone, Debug)]
pub struct OutputInterceptor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    strategy: CaptureStrategy,
    buffer: Arc<Mutex<BytesMut>>,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    capturing: bool,
    pause_depth: usize,
    #[cfg(unix)]
    redirect: Option<unix::StreamRedirect>,
}

impl OutputInterceptor {
    /// Creates an interceptor. Stream capture falls back to writer-only capture where it isn't
    /// supported.
    pub fn new(strategy: CaptureStrategy) -> Self {
        let strategy = if strategy == CaptureStrategy::Streams && !cfg!(unix) {
            warn!("stream capture is not supported on this platform, capturing writer output only");
            CaptureStrategy::WriterOnly
        } else {
            strategy
        };
        Self {
            inner: Arc::new(Inner {
                strategy,
                buffer: Arc::new(Mutex::new(BytesMut::new())),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the strategy in effect.
    pub fn strategy(&self) -> CaptureStrategy {
        self.inner.strategy
    }

    /// Starts capturing, discarding anything captured earlier.
    pub fn start(&self) {
        let mut state = lock(&self.inner.state);
        lock(&self.inner.buffer).clear();
        if self.inner.strategy == CaptureStrategy::None {
            return;
        }
        state.capturing = true;

        #[cfg(unix)]
        if self.inner.strategy == CaptureStrategy::Streams && state.redirect.is_none() {
            match unix::StreamRedirect::start(Arc::clone(&self.inner.buffer)) {
                Ok(mut redirect) => {
                    if state.pause_depth > 0
                        && let Err(err) = redirect.restore()
                    {
                        warn!("failed to pause stream capture: {err}");
                    }
                    state.redirect = Some(redirect);
                }
                Err(err) => {
                    warn!("failed to capture stdout and stderr, capturing writer output only: {err}")
                }
            }
        }
    }

    /// Stops capturing and returns everything captured since [`start`](Self::start).
    ///
    /// If a process spawned with inherited stdio still holds the captured streams, this gives up
    /// after a bounded wait and appends [`BAILOUT_MESSAGE`] to the output.
    pub fn stop(&self) -> Bytes {
        let mut state = lock(&self.inner.state);
        state.capturing = false;

        #[cfg(unix)]
        if let Some(redirect) = state.redirect.take() {
            drop(state);
            match redirect.finish() {
                Ok(unix::FinishOutcome::Drained) => {}
                Ok(unix::FinishOutcome::BailedOut) => {
                    lock(&self.inner.buffer).extend_from_slice(BAILOUT_MESSAGE.as_bytes());
                }
                Err(err) => warn!("failed to restore stdout and stderr: {err}"),
            }
        }

        lock(&self.inner.buffer).split().freeze()
    }

    /// Returns a copy of what has been captured so far, without consuming it.
    pub fn peek(&self) -> Bytes {
        Bytes::copy_from_slice(&lock(&self.inner.buffer))
    }

    /// Temporarily stops capturing the process's streams until the guard is dropped.
    ///
    /// Pauses nest: capture resumes when the outermost guard is dropped. While paused, writer
    /// output passes through to stdout.
    pub fn pause(&self) -> PauseGuard {
        let mut state = lock(&self.inner.state);
        state.pause_depth += 1;

        #[cfg(unix)]
        if state.pause_depth == 1
            && let Some(redirect) = &mut state.redirect
            && let Err(err) = redirect.restore()
        {
            warn!("failed to pause stream capture: {err}");
        }

        PauseGuard {
            interceptor: self.clone(),
        }
    }

    fn resume(&self) {
        let mut state = lock(&self.inner.state);
        state.pause_depth = state.pause_depth.saturating_sub(1);

        #[cfg(unix)]
        if state.pause_depth == 0
            && state.capturing
            && let Some(redirect) = &mut state.redirect
            && let Err(err) = redirect.redirect()
        {
            warn!("failed to resume stream capture: {err}");
        }
    }

    /// Returns true if stream capture is paused.
    pub fn is_paused(&self) -> bool {
        lock(&self.inner.state).pause_depth > 0
    }

    /// Returns a writer whose output is attributed to the running node.
    pub fn writer(&self) -> SpecWriter {
        SpecWriter {
            interceptor: self.clone(),
        }
    }
}

/// Resumes stream capture when dropped. Returned by [`OutputInterceptor::pause`].
#[derive(Debug)]
#[must_use = "capture resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    interceptor: OutputInterceptor,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.interceptor.resume();
    }
}

/// A writer attributed to the running node. Output is buffered while capture is active and not
/// paused, and written to stdout otherwise.
#[derive(Clone, Debug)]
pub struct SpecWriter {
    interceptor: OutputInterceptor,
}

impl Write for SpecWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = &self.interceptor.inner;
        let state = lock(&inner.state);
        if state.capturing && state.pause_depth == 0 {
            lock(&inner.buffer).extend_from_slice(buf);
            Ok(buf.len())
        } else {
            drop(state);
            io::stdout().write(buf)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
