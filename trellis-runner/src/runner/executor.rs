// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running a single node under supervision.
//!
//! Every hook and body runs on a blocking worker while the runner races it against the spec
//! deadline, interrupts, progress polls and the teardown grace period. A node that loses the race
//! is detached: it keeps running in the background but its result is ignored.

use super::{
    context::SpecSignal,
    supervisor::{AbortHandle, Cancellation, interrupted},
};
use crate::{
    config::PollProgress,
    helpers::panic_message,
    progress::{ProgressReport, ProgressTracker},
    reporter::{Failure, SpecState, SuiteEventKind},
    tree::{CodeLocation, NodeType},
};
use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    panic::{self, AssertUnwindSafe},
    sync::Once,
    time::Duration,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::Instant,
};
use tracing::{debug, warn};

thread_local! {
    static IN_NODE: Cell<bool> = const { Cell::new(false) };
    static PANIC_DETAILS: RefCell<Option<PanicDetails>> = const { RefCell::new(None) };
}

#[derive(Debug)]
struct PanicDetails {
    location: Option<CodeLocation>,
    backtrace: String,
}

/// Installs a panic hook that records panics raised inside nodes instead of printing them.
///
/// Panics elsewhere go to the previously installed hook.
pub(crate) fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !IN_NODE.with(Cell::get) {
                previous(info);
                return;
            }
            if info.payload().is::<SpecSignal>() {
                return;
            }
            let details = PanicDetails {
                location: info.location().map(CodeLocation::from),
                backtrace: Backtrace::force_capture().to_string(),
            };
            PANIC_DETAILS.with(|slot| *slot.borrow_mut() = Some(details));
        }));
    });
}

/// Identifies the node being run, for progress reports and failures.
#[derive(Clone, Debug)]
pub(crate) struct NodeInfo {
    pub(crate) node_type: NodeType,
    pub(crate) text: String,
    pub(crate) location: CodeLocation,
}

impl NodeInfo {
    pub(crate) fn new(node_type: NodeType, text: impl Into<String>, location: CodeLocation) -> Self {
        Self {
            node_type,
            text: text.into(),
            location,
        }
    }

    pub(crate) fn failure(
        &self,
        message: impl Into<String>,
        location: Option<CodeLocation>,
        backtrace: Option<String>,
    ) -> Failure {
        Failure {
            message: message.into(),
            location: location.unwrap_or_else(|| self.location.clone()),
            node_type: self.node_type,
            node_text: self.text.clone(),
            backtrace,
        }
    }
}

/// How a node ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeOutcome {
    Passed,
    Failed(Failure),
    Panicked(Failure),
    Skipped { message: String },
    Aborted(Failure),
    Timedout(Failure),
    Interrupted(Failure),
}

impl NodeOutcome {
    pub(crate) fn state(&self) -> SpecState {
        match self {
            Self::Passed => SpecState::Passed,
            Self::Failed(_) => SpecState::Failed,
            Self::Panicked(_) => SpecState::Panicked,
            Self::Skipped { .. } => SpecState::Skipped,
            Self::Aborted(_) => SpecState::Aborted,
            Self::Timedout(_) => SpecState::Timedout,
            Self::Interrupted(_) => SpecState::Interrupted,
        }
    }

    pub(crate) fn into_failure(self) -> Option<Failure> {
        match self {
            Self::Passed | Self::Skipped { .. } => None,
            Self::Failed(failure)
            | Self::Panicked(failure)
            | Self::Aborted(failure)
            | Self::Timedout(failure)
            | Self::Interrupted(failure) => Some(failure),
        }
    }

    fn from_panic(info: &NodeInfo, payload: Box<dyn Any + Send>) -> Self {
        let details = PANIC_DETAILS.with(|slot| slot.borrow_mut().take());
        match payload.downcast::<SpecSignal>() {
            Ok(signal) => match *signal {
                SpecSignal::Fail { message, location } => {
                    Self::Failed(info.failure(message, Some(location), None))
                }
                SpecSignal::Skip { message } => Self::Skipped { message },
                SpecSignal::AbortSuite { message, location } => {
                    Self::Aborted(info.failure(message, Some(location), None))
                }
            },
            Err(payload) => {
                let (location, backtrace) = match details {
                    Some(details) => (details.location, Some(details.backtrace)),
                    None => (None, None),
                };
                Self::Panicked(info.failure(panic_message(payload.as_ref()), location, backtrace))
            }
        }
    }
}

fn catch_node<T>(info: &NodeInfo, f: impl FnOnce() -> T) -> Result<T, NodeOutcome> {
    IN_NODE.with(|flag| flag.set(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    IN_NODE.with(|flag| flag.set(false));
    result.map_err(|payload| NodeOutcome::from_panic(info, payload))
}

/// Deadlines and progress polling shared by every node of one attempt.
#[derive(Debug)]
pub(crate) struct NodeLimits {
    started: Instant,
    poll: PollProgress,
    polls_taken: u32,
    spec_timeout: Option<Duration>,
    spec_deadline: Option<Instant>,
    grace_period: Duration,
    teardown_deadline: Option<Instant>,
    interruption: Option<Cancellation>,
    progress_reports: Vec<ProgressReport>,
}

impl NodeLimits {
    pub(crate) fn new(
        poll: PollProgress,
        spec_timeout: Option<Duration>,
        grace_period: Duration,
    ) -> Self {
        let started = Instant::now();
        Self {
            started,
            poll,
            polls_taken: 0,
            spec_timeout,
            spec_deadline: spec_timeout.map(|timeout| started + timeout),
            grace_period,
            teardown_deadline: None,
            interruption: None,
            progress_reports: Vec::new(),
        }
    }

    /// Returns the interrupt observed during this attempt, if any.
    pub(crate) fn interruption(&self) -> Option<Cancellation> {
        self.interruption
    }

    /// Checks for an interrupt at a node boundary. Returns it if one is newly observed.
    pub(crate) fn observe(&mut self, abort: &AbortHandle) -> Option<Cancellation> {
        if self.interruption.is_some() {
            return None;
        }
        let cancellation = abort.current().filter(|c| c.reason.interrupts())?;
        self.interrupt(cancellation);
        Some(cancellation)
    }

    pub(crate) fn take_progress_reports(&mut self) -> Vec<ProgressReport> {
        std::mem::take(&mut self.progress_reports)
    }

    fn interrupt(&mut self, cancellation: Cancellation) {
        debug!(reason = %cancellation.reason, "attempt interrupted");
        self.interruption = Some(cancellation);
        self.start_teardown_clock();
    }

    fn time_out(&mut self) {
        self.spec_deadline = None;
        self.start_teardown_clock();
    }

    fn start_teardown_clock(&mut self) {
        if self.teardown_deadline.is_none() {
            self.teardown_deadline = Some(Instant::now() + self.grace_period);
        }
    }

    fn teardown_expired(&self) -> bool {
        self.teardown_deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    }

    fn next_poll(&self) -> Option<Instant> {
        self.poll
            .nth_deadline(self.polls_taken)
            .map(|after| self.started + after)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs nodes on blocking workers and supervises them.
#[derive(Debug)]
pub(crate) struct NodeExecutor {
    tracker: ProgressTracker,
    abort: AbortHandle,
    reports_tx: UnboundedSender<ProgressReport>,
    reports_rx: UnboundedReceiver<ProgressReport>,
}

impl NodeExecutor {
    pub(crate) fn new(tracker: ProgressTracker, abort: AbortHandle) -> Self {
        let (reports_tx, reports_rx) = unbounded_channel();
        Self {
            tracker,
            abort,
            reports_tx,
            reports_rx,
        }
    }

    /// Returns a sender for progress reports taken outside the supervision loop.
    pub(crate) fn report_sender(&self) -> UnboundedSender<ProgressReport> {
        self.reports_tx.clone()
    }

    /// Emits progress reports that arrived while no node was being supervised.
    pub(crate) fn drain_reports(
        &mut self,
        limits: &mut NodeLimits,
        emit: &mut dyn FnMut(SuiteEventKind),
    ) {
        while let Ok(report) = self.reports_rx.try_recv() {
            record_report(limits, emit, report);
        }
    }

    /// Runs `f` as the node described by `info`.
    ///
    /// The value returned by `f` is only available if the node passed.
    pub(crate) async fn run<T: Send + 'static>(
        &mut self,
        limits: &mut NodeLimits,
        info: &NodeInfo,
        emit: &mut dyn FnMut(SuiteEventKind),
        f: impl FnOnce() -> T + Send + 'static,
    ) -> (NodeOutcome, Option<T>) {
        if limits.teardown_expired() {
            let message = "not run: the grace period had expired";
            return (self.abandoned(limits, info, message), None);
        }

        self.tracker
            .begin_node(info.node_type, info.text.clone(), info.location.clone());
        let task_info = info.clone();
        let mut handle = tokio::task::spawn_blocking(move || catch_node(&task_info, f));
        let mut cancel = self.abort.subscribe();
        let mut interrupted_here = None;

        let (outcome, value) = loop {
            let poll_at = limits.next_poll();
            tokio::select! {
                joined = &mut handle => {
                    break match joined {
                        Ok(Ok(value)) => (NodeOutcome::Passed, Some(value)),
                        Ok(Err(outcome)) => (outcome, None),
                        Err(err) => {
                            let message = format!("node worker failed: {err}");
                            (NodeOutcome::Panicked(info.failure(message, None, None)), None)
                        }
                    };
                }
                () = sleep_until(limits.spec_deadline) => {
                    let timeout = limits.spec_timeout.unwrap_or_default();
                    debug!(node = %info.node_type, ?timeout, "spec deadline expired");
                    limits.time_out();
                    let message = format!("spec timed out after {timeout:?}");
                    break (NodeOutcome::Timedout(info.failure(message, None, None)), None);
                }
                () = sleep_until(limits.teardown_deadline) => {
                    warn!(
                        node = %info.node_type,
                        location = %info.location,
                        "node did not finish within the grace period, abandoning it",
                    );
                    let message = "abandoned after the grace period expired";
                    break (self.abandoned(limits, info, message), None);
                }
                cancellation = interrupted(&mut cancel), if limits.interruption.is_none() => {
                    limits.interrupt(cancellation);
                    interrupted_here = Some(cancellation);
                }
                Some(report) = self.reports_rx.recv() => {
                    record_report(limits, emit, report);
                }
                () = sleep_until(poll_at) => {
                    limits.polls_taken += 1;
                    if let Some(report) = self.tracker.snapshot() {
                        record_report(limits, emit, report);
                    }
                }
            }
        };
        self.tracker.end_node();

        // A node that was running when the interrupt arrived is reported as interrupted, however
        // it ended.
        let outcome = match (interrupted_here, outcome) {
            (
                Some(cancellation),
                NodeOutcome::Passed | NodeOutcome::Failed(_) | NodeOutcome::Panicked(_),
            ) => NodeOutcome::Interrupted(info.failure(cancellation.message, None, None)),
            (_, outcome) => outcome,
        };
        (outcome, value)
    }

    fn abandoned(&self, limits: &NodeLimits, info: &NodeInfo, message: &str) -> NodeOutcome {
        match limits.interruption {
            Some(cancellation) => NodeOutcome::Interrupted(info.failure(
                format!("{}: {message}", cancellation.message),
                None,
                None,
            )),
            None => NodeOutcome::Timedout(info.failure(message, None, None)),
        }
    }
}

fn record_report(
    limits: &mut NodeLimits,
    emit: &mut dyn FnMut(SuiteEventKind),
    report: ProgressReport,
) {
    emit(SuiteEventKind::ProgressReport {
        report: report.clone(),
    });
    limits.progress_reports.push(report);
}
