// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    list::SpecId,
    progress::ProgressReport,
    tree::{CodeLocation, NodeType},
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{fmt, time::Duration};

/// A suite event.
///
/// Events are produced by a [`SuiteRunner`](crate::runner::SuiteRunner) and passed to the callback
/// given to [`execute`](crate::runner::SuiteRunner::execute).
#[derive(Clone, Debug)]
pub struct SuiteEvent {
    /// The time at which the event was generated.
    pub timestamp: DateTime<Local>,

    /// The amount of time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of suite event this is.
    pub kind: SuiteEventKind,
}

/// The kind of suite event this is.
///
/// Forms part of [`SuiteEvent`].
#[derive(Clone, Debug)]
pub enum SuiteEventKind {
    /// The run started.
    SuiteStarted {
        /// The name of the suite.
        suite_name: String,

        /// The seed specs were shuffled with.
        seed: u64,

        /// The number of specs selected to run, across all processes.
        spec_count: usize,

        /// This process's index.
        process: usize,

        /// The total number of processes.
        total: usize,
    },

    /// A suite-level node finished.
    SuiteNodeFinished {
        /// The node's report.
        report: SuiteNodeReport,
    },

    /// A spec started its first attempt.
    SpecStarted {
        /// The spec.
        spec_id: SpecId,

        /// The spec's full text.
        text: String,
    },

    /// An attempt of a spec failed.
    AttemptFailed {
        /// The spec.
        spec_id: SpecId,

        /// The failed attempt.
        attempt: RunAttempt,

        /// True if another attempt will be made.
        will_retry: bool,
    },

    /// A spec reached its final state. Filtered specs are reported here too.
    SpecFinished {
        /// The spec's report.
        report: SpecReport,
    },

    /// A progress report was taken, automatically or on request.
    ProgressReport {
        /// The report.
        report: ProgressReport,
    },

    /// The run is being cancelled.
    SuiteCancelled {
        /// Why the run is being cancelled.
        reason: CancelReason,
    },

    /// The run finished.
    SuiteFinished {
        /// Statistics for the run.
        stats: RunStats,
    },
}

// Note: the order here matters -- it indicates severity of cancellation
/// The reason why a run is being cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// A spec failed and fail-fast is enabled.
    FailFast,

    /// A spec or the caller aborted the suite.
    SuiteAbort,

    /// Another process of a parallel run aborted.
    ParallelAbort,

    /// The suite deadline expired.
    Timeout,

    /// A termination signal (on Unix, SIGTERM or SIGHUP) was received.
    Signal,

    /// An interrupt (on Unix, Ctrl-C) was received, or the caller interrupted the run.
    Interrupt,
}

impl CancelReason {
    /// Returns true if the in-flight spec is interrupted rather than allowed to finish.
    pub fn interrupts(self) -> bool {
        matches!(self, Self::Timeout | Self::Signal | Self::Interrupt)
    }

    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail-fast",
            Self::SuiteAbort => "suite abort",
            Self::ParallelAbort => "abort in another process",
            Self::Timeout => "suite timeout",
            Self::Signal => "signal",
            Self::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_static_str())
    }
}

/// The state of a spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecState {
    /// The spec, or an ancestor, is Pending.
    Pending,

    /// The spec was not run, or skipped itself.
    Skipped,

    /// The spec passed.
    Passed,

    /// A hook or the body failed.
    Failed,

    /// A hook or the body panicked.
    Panicked,

    /// The run was interrupted while the spec was running.
    Interrupted,

    /// The spec aborted the suite.
    Aborted,

    /// The attempt's deadline expired.
    Timedout,
}

impl SpecState {
    /// Returns true if this state fails the suite.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Panicked | Self::Interrupted | Self::Aborted | Self::Timedout
        )
    }

    /// Returns the name of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Panicked => "panicked",
            Self::Interrupted => "interrupted",
            Self::Aborted => "aborted",
            Self::Timedout => "timedout",
        }
    }
}

impl fmt::Display for SpecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a spec was skipped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum SkipReason {
    /// Another spec is focused and this one isn't.
    Focus,

    /// The spec's labels don't satisfy the label filter.
    LabelFilter,

    /// The spec's semantic version constraint rejects the filter version.
    SemVer,

    /// The spec's text doesn't match the focus patterns or matches a skip pattern.
    TextFilter,

    /// The spec's location doesn't match the location selectors.
    LocationFilter,

    /// An earlier spec in the same Ordered container failed.
    EarlierOrderedFailure,

    /// The run was cancelled before the spec was scheduled.
    Aborted,

    /// The spec called [`SpecContext::skip`](crate::runner::SpecContext::skip).
    SkippedByBody {
        /// The message passed to `skip`.
        message: String,
    },

    /// A before-suite node failed.
    SuiteSetupFailed,
}

/// Details of a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Failure {
    /// The failure message.
    pub message: String,

    /// Where the failure was raised.
    pub location: CodeLocation,

    /// The kind of node that failed.
    pub node_type: NodeType,

    /// The text of the node that failed.
    pub node_text: String,

    /// The backtrace, for panics.
    pub backtrace: Option<String>,
}

/// One attempt at running a spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunAttempt {
    /// The 1-based attempt number.
    pub index: u32,

    /// The outcome of the attempt.
    pub state: SpecState,

    /// When the attempt started.
    pub start_time: DateTime<Local>,

    /// How long the attempt took, including teardown.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Output captured during the attempt.
    pub captured_output: String,

    /// Progress reports taken during the attempt.
    pub progress_reports: Vec<ProgressReport>,

    /// The first failure of the attempt.
    pub failure: Option<Failure>,

    /// Failures raised after the first, typically by teardown.
    pub additional_failures: Vec<Failure>,
}

/// The report for one spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpecReport {
    /// The spec's id.
    pub spec_id: SpecId,

    /// The texts of the enclosing containers, outermost first.
    pub container_texts: Vec<String>,

    /// The leaf's text.
    pub text: String,

    /// Where the leaf was declared.
    pub location: CodeLocation,

    /// The spec's merged labels.
    pub labels: Vec<SmolStr>,

    /// The final state. `None` in preview reports.
    pub state: Option<SpecState>,

    /// Why the spec was skipped.
    pub skip_reason: Option<SkipReason>,

    /// Every attempt, in order.
    pub attempts: Vec<RunAttempt>,

    /// The failure of the final attempt.
    pub failure: Option<Failure>,

    /// When the first attempt started.
    pub start_time: Option<DateTime<Local>>,

    /// Total time across all attempts.
    #[serde(with = "humantime_serde")]
    pub run_time: Duration,

    /// The process that ran the spec.
    pub process: usize,
}

impl SpecReport {
    /// Returns the container texts and the leaf text joined by spaces.
    pub fn full_text(&self) -> String {
        self.container_texts
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.text.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Returns true if the spec passed after failing at least once.
    pub fn is_flaky(&self) -> bool {
        self.state == Some(SpecState::Passed)
            && self.attempts.iter().any(|a| a.state.is_failure())
    }
}

/// The report for a suite-level node such as a before-suite hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteNodeReport {
    /// The kind of node.
    pub node_type: NodeType,

    /// Where the node was declared.
    pub location: CodeLocation,

    /// The outcome.
    pub state: SpecState,

    /// How long the node took.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Output captured while the node ran.
    pub captured_output: String,

    /// The failure, if any.
    pub failure: Option<Failure>,

    /// The process that ran the node.
    pub process: usize,
}

/// The filters that were applied to a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppliedFilters {
    /// The label filter expression.
    pub label_filter: String,

    /// The version semantic version constraints were matched against.
    pub semver_filter: String,

    /// Focus text patterns.
    pub focus: Vec<String>,

    /// Skip text patterns.
    pub skip: Vec<String>,

    /// Focus location selectors.
    pub focus_file: Vec<String>,

    /// Skip location selectors.
    pub skip_file: Vec<String>,
}

/// Why the suite failed, beyond individual spec failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum SuiteFailure {
    /// A before-suite node failed.
    BeforeSuiteFailed,

    /// An after-suite node failed.
    AfterSuiteFailed,

    /// A cooperating process terminated abnormally.
    ParallelProcessFailure {
        /// A description of the failure.
        message: String,
    },

    /// The run was cancelled.
    Cancelled {
        /// Why the run was cancelled.
        reason: CancelReason,
    },
}

/// Statistics for a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunStats {
    /// The number of specs in the suite.
    pub total: usize,

    /// The number of specs that ran.
    pub ran: usize,

    /// The number of specs that passed, including flaky ones.
    pub passed: usize,

    /// The number of specs that passed after failing at least once.
    pub flaky: usize,

    /// The number of specs that failed, panicked, timed out, were interrupted or aborted.
    pub failed: usize,

    /// The number of skipped specs.
    pub skipped: usize,

    /// The number of pending specs.
    pub pending: usize,
}

impl RunStats {
    pub(crate) fn record(&mut self, report: &SpecReport) {
        let Some(state) = report.state else { return };
        if !report.attempts.is_empty() {
            self.ran += 1;
        }
        match state {
            SpecState::Pending => self.pending += 1,
            SpecState::Skipped => self.skipped += 1,
            SpecState::Passed => {
                self.passed += 1;
                if report.is_flaky() {
                    self.flaky += 1;
                }
            }
            _ => self.failed += 1,
        }
    }
}

/// The report for a whole run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteReport {
    /// The name of the suite.
    pub suite_name: String,

    /// The seed specs were shuffled with.
    pub seed: u64,

    /// The total number of processes.
    pub process_count: usize,

    /// The process that produced this report.
    pub process_index: usize,

    /// The filters applied to the run.
    pub filters: AppliedFilters,

    /// When the run started.
    pub start_time: DateTime<Local>,

    /// When the run finished. `None` for partial reports.
    pub end_time: Option<DateTime<Local>>,

    /// Spec reports, ordered by spec id.
    pub spec_reports: Vec<SpecReport>,

    /// Reports for suite-level nodes, in the order they ran.
    pub suite_node_reports: Vec<SuiteNodeReport>,

    /// Why the suite failed, beyond individual spec failures.
    pub suite_failure: Option<SuiteFailure>,

    /// Statistics for the run.
    pub stats: RunStats,

    /// True if this report came from [`preview`](crate::runner::preview).
    pub preview: bool,
}

impl SuiteReport {
    /// Returns true if no spec failed and no suite-level failure occurred.
    pub fn is_success(&self) -> bool {
        self.suite_failure.is_none()
            && self.stats.failed == 0
            && self
                .suite_node_reports
                .iter()
                .all(|node| !node.state.is_failure())
    }

    /// Returns the report for a spec.
    pub fn spec(&self, id: SpecId) -> Option<&SpecReport> {
        self.spec_reports
            .binary_search_by_key(&id, |report| report.spec_id)
            .ok()
            .map(|index| &self.spec_reports[index])
    }

    /// Returns the report for the first spec whose leaf text is `text`.
    pub fn spec_by_text(&self, text: &str) -> Option<&SpecReport> {
        self.spec_reports.iter().find(|report| report.text == text)
    }
}
