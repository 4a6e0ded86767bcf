// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    AppliedFilters, RunStats, SkipReason, SpecReport, SpecState, SuiteFailure, SuiteNodeReport,
    SuiteReport,
};
use crate::{helpers::lock, list::SpecId};
use chrono::Local;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::debug;

/// Accumulates spec reports into a [`SuiteReport`].
///
/// Cloning produces another handle to the same report, so a partial report can be read while the
/// run is in progress.
#[derive(Clone, Debug)]
pub struct ReportAggregator {
    inner: Arc<Mutex<SuiteReport>>,
}

impl ReportAggregator {
    pub(crate) fn new(
        suite_name: &str,
        seed: u64,
        process_count: usize,
        process_index: usize,
        filters: AppliedFilters,
        total: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SuiteReport {
                suite_name: suite_name.to_owned(),
                seed,
                process_count,
                process_index,
                filters,
                start_time: Local::now(),
                end_time: None,
                spec_reports: Vec::new(),
                suite_node_reports: Vec::new(),
                suite_failure: None,
                stats: RunStats {
                    total,
                    ..RunStats::default()
                },
                preview: false,
            })),
        }
    }

    pub(crate) fn set_preview(&self) {
        lock(&self.inner).preview = true;
    }

    /// Records a finished spec. Recording the same spec twice replaces the earlier report.
    pub(crate) fn record(&self, report: SpecReport) {
        let mut inner = lock(&self.inner);
        match inner
            .spec_reports
            .binary_search_by_key(&report.spec_id, |r| r.spec_id)
        {
            Ok(index) => inner.spec_reports[index] = report,
            Err(index) => inner.spec_reports.insert(index, report),
        }
    }

    pub(crate) fn record_suite_node(&self, report: SuiteNodeReport) {
        lock(&self.inner).suite_node_reports.push(report);
    }

    /// Records a suite-level failure. The first one recorded wins.
    pub(crate) fn set_suite_failure(&self, failure: SuiteFailure) {
        let mut inner = lock(&self.inner);
        if inner.suite_failure.is_none() {
            inner.suite_failure = Some(failure);
        }
    }

    /// Returns true if the spec has already been recorded.
    pub(crate) fn contains(&self, id: SpecId) -> bool {
        lock(&self.inner)
            .spec_reports
            .binary_search_by_key(&id, |r| r.spec_id)
            .is_ok()
    }

    /// Returns the report as it stands.
    pub fn snapshot(&self) -> SuiteReport {
        let mut report = lock(&self.inner).clone();
        report.stats = compute_stats(report.stats.total, &report.spec_reports);
        report
    }

    /// Merges reports from other processes into this one.
    ///
    /// Spec reports are keyed by spec id. When two processes report the same spec, the one that
    /// actually ran it wins.
    pub(crate) fn merge(&self, others: impl IntoIterator<Item = SuiteReport>) {
        let mut inner = lock(&self.inner);
        let mut by_id: BTreeMap<SpecId, SpecReport> = std::mem::take(&mut inner.spec_reports)
            .into_iter()
            .map(|r| (r.spec_id, r))
            .collect();

        for other in others {
            debug!(
                process = other.process_index,
                specs = other.spec_reports.len(),
                "merging report"
            );
            for report in other.spec_reports {
                match by_id.get(&report.spec_id) {
                    Some(existing) if !existing.attempts.is_empty() => {}
                    _ => {
                        by_id.insert(report.spec_id, report);
                    }
                }
            }
            inner.suite_node_reports.extend(other.suite_node_reports);
            if inner.suite_failure.is_none() {
                inner.suite_failure = other.suite_failure;
            }
        }
        inner.spec_reports = by_id.into_values().collect();
    }

    /// Finalizes the report: stamps the end time and recomputes the stats.
    pub(crate) fn finish(&self) -> SuiteReport {
        let mut inner = lock(&self.inner);
        inner.end_time = Some(Local::now());
        inner.stats = compute_stats(inner.stats.total, &inner.spec_reports);
        inner.clone()
    }
}

fn compute_stats(total: usize, reports: &[SpecReport]) -> RunStats {
    let mut stats = RunStats {
        total,
        ..RunStats::default()
    };
    for report in reports {
        stats.record(report);
    }
    stats
}

/// Creates the report for a spec that never ran.
pub(crate) fn not_run_report(
    mut report: SpecReport,
    state: Option<SpecState>,
    skip_reason: Option<SkipReason>,
) -> SpecReport {
    report.state = state;
    report.skip_reason = skip_reason;
    report.attempts.clear();
    report.failure = None;
    report.run_time = Duration::ZERO;
    report
}
