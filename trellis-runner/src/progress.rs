// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Progress introspection for the running spec.
//!
//! The runner records what it is doing in a [`ProgressTracker`]. Snapshots can be taken at any time
//! from any thread; they hold the tracker's lock only long enough to copy its state, and progress
//! reporter callbacks run outside it.

use crate::{
    helpers::{lock, panic_message},
    list::SpecId,
    output::OutputInterceptor,
    tree::{CodeLocation, NodeType},
};
use chrono::{DateTime, Local};
use debug_ignore::DebugIgnore;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};
use swrite::{SWrite, swrite, swriteln};

/// A point-in-time description of what the runner is doing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProgressReport {
    /// The running spec, or `None` while a suite-level node runs.
    pub spec_id: Option<SpecId>,

    /// The full text of the running spec, or the name of the suite node.
    pub spec_text: String,

    /// Where the spec was declared.
    pub location: CodeLocation,

    /// How long the spec has been running.
    #[serde(with = "humantime_serde")]
    pub spec_elapsed: Duration,

    /// The hook or body currently running.
    pub current_node: Option<NodeProgress>,

    /// The most recent step recorded with [`SpecContext::by`](crate::runner::SpecContext::by).
    pub current_step: Option<StepProgress>,

    /// Output captured so far in this attempt.
    pub captured_output: String,

    /// The output of registered progress reporters.
    pub additional_reports: Vec<String>,

    /// When the report was taken.
    pub timestamp: DateTime<Local>,
}

/// The node running when a [`ProgressReport`] was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeProgress {
    /// The kind of node.
    pub node_type: NodeType,

    /// The node's text. Hooks report their node type.
    pub text: String,

    /// Where the node was declared.
    pub location: CodeLocation,

    /// How long the node has been running.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// The step recorded when a [`ProgressReport`] was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepProgress {
    /// The step's description.
    pub text: String,

    /// Where the step was recorded.
    pub location: CodeLocation,

    /// How long ago the step began.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        swriteln!(
            out,
            "{} (Spec Runtime: {:.3?})",
            self.spec_text,
            self.spec_elapsed
        );
        swriteln!(out, "  {}", self.location);
        if let Some(node) = &self.current_node {
            swriteln!(
                out,
                "  In [{}] {} (Node Runtime: {:.3?})",
                node.node_type,
                node.text,
                node.elapsed
            );
            swriteln!(out, "    {}", node.location);
        }
        if let Some(step) = &self.current_step {
            swriteln!(
                out,
                "  At [By Step] {} (Step Runtime: {:.3?})",
                step.text,
                step.elapsed
            );
            swriteln!(out, "    {}", step.location);
        }
        if !self.captured_output.is_empty() {
            swriteln!(out, "  Captured output:");
            for line in self.captured_output.lines() {
                swriteln!(out, "    {line}");
            }
        }
        for report in &self.additional_reports {
            swrite!(out, "  {report}");
            if !report.ends_with('\n') {
                out.push('\n');
            }
        }
        f.write_str(&out)
    }
}

type ReporterFn = Arc<dyn Fn() -> String + Send + Sync>;

/// Shared record of the running spec, node and step.
#[derive(Clone, Debug)]
pub(crate) struct ProgressTracker {
    inner: Arc<Mutex<TrackerState>>,
    output: OutputInterceptor,
}

#[derive(Debug, Default)]
struct TrackerState {
    spec: Option<RunningSpec>,
    node: Option<RunningNode>,
    step: Option<RunningStep>,
    reporters: BTreeMap<u64, DebugIgnore<ReporterFn>>,
    next_reporter: u64,
}

#[derive(Debug)]
struct RunningSpec {
    id: Option<SpecId>,
    text: String,
    location: CodeLocation,
    started: Instant,
}

#[derive(Debug)]
struct RunningNode {
    node_type: NodeType,
    text: String,
    location: CodeLocation,
    started: Instant,
}

#[derive(Debug)]
struct RunningStep {
    text: String,
    location: CodeLocation,
    started: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(output: OutputInterceptor) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerState::default())),
            output,
        }
    }

    /// Records the start of a spec attempt, or of a suite-level node when `id` is `None`.
    pub(crate) fn begin_spec(&self, id: Option<SpecId>, text: String, location: CodeLocation) {
        let mut state = lock(&self.inner);
        state.spec = Some(RunningSpec {
            id,
            text,
            location,
            started: Instant::now(),
        });
        state.node = None;
        state.step = None;
    }

    /// Clears the running spec and unregisters every progress reporter.
    pub(crate) fn end_spec(&self) {
        let mut state = lock(&self.inner);
        state.spec = None;
        state.node = None;
        state.step = None;
        state.reporters.clear();
    }

    pub(crate) fn begin_node(&self, node_type: NodeType, text: String, location: CodeLocation) {
        lock(&self.inner).node = Some(RunningNode {
            node_type,
            text,
            location,
            started: Instant::now(),
        });
    }

    pub(crate) fn end_node(&self) {
        lock(&self.inner).node = None;
    }

    pub(crate) fn by(&self, text: String, location: CodeLocation) {
        lock(&self.inner).step = Some(RunningStep {
            text,
            location,
            started: Instant::now(),
        });
    }

    pub(crate) fn add_reporter(&self, reporter: ReporterFn) -> ProgressReporterGuard {
        let mut state = lock(&self.inner);
        let key = state.next_reporter;
        state.next_reporter += 1;
        state.reporters.insert(key, DebugIgnore(reporter));
        ProgressReporterGuard {
            tracker: Arc::downgrade(&self.inner),
            key,
        }
    }

    /// Takes a snapshot, or returns `None` if nothing is running.
    pub(crate) fn snapshot(&self) -> Option<ProgressReport> {
        let (mut report, reporters) = {
            let state = lock(&self.inner);
            let spec = state.spec.as_ref()?;
            let report = ProgressReport {
                spec_id: spec.id,
                spec_text: spec.text.clone(),
                location: spec.location.clone(),
                spec_elapsed: spec.started.elapsed(),
                current_node: state.node.as_ref().map(|node| NodeProgress {
                    node_type: node.node_type,
                    text: node.text.clone(),
                    location: node.location.clone(),
                    elapsed: node.started.elapsed(),
                }),
                current_step: state.step.as_ref().map(|step| StepProgress {
                    text: step.text.clone(),
                    location: step.location.clone(),
                    elapsed: step.started.elapsed(),
                }),
                captured_output: String::new(),
                additional_reports: Vec::new(),
                timestamp: Local::now(),
            };
            let reporters: Vec<ReporterFn> =
                state.reporters.values().map(|r| Arc::clone(&r.0)).collect();
            (report, reporters)
        };

        report.captured_output = String::from_utf8_lossy(&self.output.peek()).into_owned();
        report.additional_reports = reporters
            .iter()
            .map(|reporter| {
                panic::catch_unwind(AssertUnwindSafe(|| reporter())).unwrap_or_else(|payload| {
                    format!("progress reporter panicked: {}", panic_message(payload.as_ref()))
                })
            })
            .collect();
        Some(report)
    }
}

/// Unregisters a progress reporter when dropped.
///
/// Reporters are also unregistered when the attempt that registered them ends.
#[derive(Debug)]
#[must_use = "the reporter is unregistered as soon as the guard is dropped"]
pub struct ProgressReporterGuard {
    tracker: Weak<Mutex<TrackerState>>,
    key: u64,
}

impl Drop for ProgressReporterGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            lock(&tracker).reporters.remove(&self.key);
        }
    }
}

/// A handle for requesting progress reports from outside the runner.
#[derive(Clone, Debug)]
pub struct ProgressHandle {
    tracker: ProgressTracker,
}

impl ProgressHandle {
    pub(crate) fn new(tracker: ProgressTracker) -> Self {
        Self { tracker }
    }

    /// Returns a report on the running spec, or `None` if no spec is running.
    pub fn snapshot(&self) -> Option<ProgressReport> {
        self.tracker.snapshot()
    }
}
