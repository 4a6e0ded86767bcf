// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    helpers::lock,
    output::{OutputInterceptor, PauseGuard, SpecWriter},
    progress::{ProgressReport, ProgressReporterGuard, ProgressTracker},
    tree::CodeLocation,
};
use debug_ignore::DebugIgnore;
use std::{
    panic,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc::UnboundedSender;

/// Control flow raised from inside a node with [`std::panic::panic_any`].
#[derive(Debug)]
pub(crate) enum SpecSignal {
    Fail {
        message: String,
        location: CodeLocation,
    },
    Skip {
        message: String,
    },
    AbortSuite {
        message: String,
        location: CodeLocation,
    },
}

type CleanupFn = Box<dyn FnOnce(&SpecContext) + Send>;

/// A cleanup registered with [`SpecContext::defer_cleanup`].
#[derive(Debug)]
pub(crate) struct Cleanup {
    pub(crate) location: CodeLocation,
    pub(crate) body: DebugIgnore<CleanupFn>,
}

/// The handle passed to every hook and body.
///
/// A context is scoped to one attempt of one spec, or to one suite-level node.
#[derive(Clone, Debug)]
pub struct SpecContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    output: OutputInterceptor,
    tracker: ProgressTracker,
    reports: UnboundedSender<ProgressReport>,
    attempt: u32,
    process: usize,
    total: usize,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl SpecContext {
    pub(crate) fn new(
        output: OutputInterceptor,
        tracker: ProgressTracker,
        reports: UnboundedSender<ProgressReport>,
        attempt: u32,
        process: usize,
        total: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                output,
                tracker,
                reports,
                attempt,
                process,
                total,
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fails the running node with `message`.
    ///
    /// Nothing after the call runs. Teardown for the spec still runs.
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) -> ! {
        panic::panic_any(SpecSignal::Fail {
            message: message.into(),
            location: CodeLocation::caller(),
        })
    }

    /// Marks the spec as skipped and stops the running node. Teardown still runs.
    pub fn skip(&self, message: impl Into<String>) -> ! {
        panic::panic_any(SpecSignal::Skip {
            message: message.into(),
        })
    }

    /// Fails the spec as Aborted and stops the run once its teardown has finished.
    #[track_caller]
    pub fn abort_suite(&self, message: impl Into<String>) -> ! {
        panic::panic_any(SpecSignal::AbortSuite {
            message: message.into(),
            location: CodeLocation::caller(),
        })
    }

    /// Registers a cleanup. Cleanups run after the spec's teardown hooks, most recent first.
    ///
    /// Cleanups registered from a `BeforeAll` hook run after the matching `AfterAll`.
    #[track_caller]
    pub fn defer_cleanup(&self, cleanup: impl FnOnce(&SpecContext) + Send + 'static) {
        lock(&self.inner.cleanups).push(Cleanup {
            location: CodeLocation::caller(),
            body: DebugIgnore(Box::new(cleanup)),
        });
    }

    pub(crate) fn take_cleanups(&self) -> Vec<Cleanup> {
        std::mem::take(&mut *lock(&self.inner.cleanups))
    }

    /// Returns a writer whose output is captured into the spec's report.
    pub fn writer(&self) -> SpecWriter {
        self.inner.output.writer()
    }

    /// Stops capturing output until the returned guard is dropped. Pauses nest.
    pub fn pause_output(&self) -> PauseGuard {
        self.inner.output.pause()
    }

    /// Records the step the spec is at. Progress reports include the most recent step.
    #[track_caller]
    pub fn by(&self, step: impl Into<String>) {
        self.inner.tracker.by(step.into(), CodeLocation::caller());
    }

    /// Registers a callback whose output is included in progress reports until the guard is
    /// dropped or the attempt ends.
    pub fn add_progress_reporter(
        &self,
        reporter: impl Fn() -> String + Send + Sync + 'static,
    ) -> ProgressReporterGuard {
        self.inner.tracker.add_reporter(Arc::new(reporter))
    }

    /// Takes a progress report now. The report is also emitted as an event and recorded on the
    /// attempt.
    pub fn progress_report(&self) -> Option<ProgressReport> {
        let report = self.inner.tracker.snapshot()?;
        // The receiver only goes away once the run is over.
        let _ = self.inner.reports.send(report.clone());
        Some(report)
    }

    /// Returns the 1-based attempt number. Suite-level nodes report 1.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// Returns this process's 1-based index in a parallel run.
    pub fn parallel_process(&self) -> usize {
        self.inner.process
    }

    /// Returns the total number of processes in a parallel run.
    pub fn parallel_total(&self) -> usize {
        self.inner.total
    }
}
