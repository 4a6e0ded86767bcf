// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    context::{Cleanup, SpecContext},
    executor::{NodeExecutor, NodeInfo, NodeLimits, NodeOutcome, install_panic_hook},
    retry::RetryController,
    supervisor::AbortHandle,
};
use crate::{
    config::{ParallelConfig, PollProgress, RetryPolicy, SuiteConfig},
    errors::{ConfigParseError, ParallelError, SuiteRunnerBuildError},
    helpers::plural,
    list::{ExecutionUnit, Spec, SpecList, order_units},
    output::OutputInterceptor,
    parallel::{Coordinator, ParallelSession},
    progress::{ProgressHandle, ProgressTracker},
    reporter::{
        CancelReason, Failure, ReportAggregator, RunAttempt, SkipReason, SpecReport, SpecState,
        SuiteEvent, SuiteEventKind, SuiteFailure, SuiteNodeReport, SuiteReport, not_run_report,
    },
    signal::{SignalEvent, SignalHandler, SignalHandlerKind},
    test_filter::{FilterMatch, SpecFilterCriteria},
    time::{StopwatchStart, stopwatch},
    tree::{
        AfterSuiteNode, BeforeSuiteNode, CodeLocation, Hook, HookKind, NodeId, NodeType,
        PrimaryBody, Suite, TreeNode,
    },
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Runtime;
use tracing::{debug, instrument, warn};

/// Suite runner options.
#[derive(Debug, Default)]
pub struct SuiteRunnerBuilder {
    parallel: Option<ParallelSession>,
}

impl SuiteRunnerBuilder {
    /// Runs this process as one process of a parallel run.
    ///
    /// The session's config takes precedence over [`SuiteConfig::parallel`].
    pub fn set_parallel_session(&mut self, session: ParallelSession) -> &mut Self {
        self.parallel = Some(session);
        self
    }

    /// Creates a new suite runner.
    ///
    /// Validates `config`, resolves the spec list, applies the filters and orders the scheduling
    /// units. No node runs until [`SuiteRunner::execute`] is called.
    pub fn build<'s>(
        self,
        suite: &'s Suite,
        config: &SuiteConfig,
        signal_handler: SignalHandlerKind,
    ) -> Result<SuiteRunner<'s>, SuiteRunnerBuildError> {
        config
            .validate()
            .map_err(|kind| ConfigParseError::new(None, kind))?;
        let parallel = match &self.parallel {
            Some(session) => session.config().clone(),
            None => config.parallel.clone(),
        };
        let coordinator = match &self.parallel {
            Some(session) if parallel.is_parallel() => Some(session.coordinator()),
            Some(_) => None,
            None if parallel.is_parallel() => {
                return Err(SuiteRunnerBuildError::MissingParallelClient {
                    total: parallel.total.get(),
                });
            }
            None => None,
        };

        let criteria = SpecFilterCriteria::from_config(config)?;
        let list = SpecList::resolve(suite);
        let matches = list
            .iter()
            .map(|spec| criteria.filter_match(spec, list.has_programmatic_focus()))
            .collect();
        let seed = config.resolved_seed_for(&parallel);
        let units = order_units(&list, seed, config.randomize_all_specs);
        debug!(
            suite = suite.name(),
            specs = list.len(),
            units = units.len(),
            seed,
            "suite resolved",
        );

        install_panic_hook();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("trellis-runner-worker")
            .build()
            .map_err(SuiteRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        let output = OutputInterceptor::new(config.capture);
        let tracker = ProgressTracker::new(output.clone());
        let aggregator = ReportAggregator::new(
            suite.name(),
            seed,
            parallel.total.get(),
            parallel.process.get(),
            criteria.applied(),
            list.len(),
        );

        Ok(SuiteRunner {
            inner: SuiteRunnerInner {
                suite,
                list,
                units,
                matches,
                seed,
                settings: RunSettings::new(config),
                parallel,
                coordinator,
                output,
                tracker,
                abort: AbortHandle::new(),
                aggregator,
                runtime,
            },
            signal_handler,
        })
    }
}

/// Context for running a suite.
///
/// Created using [`SuiteRunnerBuilder::build`].
#[derive(Debug)]
pub struct SuiteRunner<'s> {
    inner: SuiteRunnerInner<'s>,
    signal_handler: SignalHandler,
}

impl<'s> SuiteRunner<'s> {
    /// Returns the resolved spec list.
    pub fn spec_list(&self) -> &SpecList<'s> {
        &self.inner.list
    }

    /// Returns the seed the run is ordered with.
    pub fn seed(&self) -> u64 {
        self.inner.seed
    }

    /// Returns a handle that aborts or interrupts the run from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.inner.abort.clone()
    }

    /// Returns a handle that takes progress reports of the running spec on demand.
    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle::new(self.inner.tracker.clone())
    }

    /// Returns a handle to the report as it is being built.
    pub fn report_aggregator(&self) -> ReportAggregator {
        self.inner.aggregator.clone()
    }

    /// Runs the suite.
    ///
    /// The callback is called with each event as it happens.
    pub fn execute<F>(self, mut callback: F) -> SuiteOutcome
    where
        F: FnMut(SuiteEvent) + Send,
    {
        let Self {
            inner,
            signal_handler,
        } = self;
        let report = inner
            .runtime
            .block_on(inner.execute(signal_handler, &mut callback));

        // Nodes abandoned after a timeout or interrupt may still be running on blocking workers.
        // Shut down without waiting for them.
        inner.runtime.shutdown_background();

        SuiteOutcome {
            passed: report.is_success(),
            report,
        }
    }
}

/// The result of [`SuiteRunner::execute`].
#[derive(Clone, Debug)]
pub struct SuiteOutcome {
    /// True if every spec that ran passed and no suite-level failure occurred.
    pub passed: bool,

    /// The aggregated report. On the primary process of a parallel run, this covers every
    /// process.
    pub report: SuiteReport,
}

/// Builds the report of a dry run: every spec is listed with the filter decision that applies to
/// it, and no node runs.
pub fn preview(suite: &Suite, config: &SuiteConfig) -> Result<SuiteReport, SuiteRunnerBuildError> {
    config
        .validate()
        .map_err(|kind| ConfigParseError::new(None, kind))?;
    let criteria = SpecFilterCriteria::from_config(config)?;
    let list = SpecList::resolve(suite);
    let process = config.parallel.process.get();
    let aggregator = ReportAggregator::new(
        suite.name(),
        config.resolved_seed(),
        config.parallel.total.get(),
        process,
        criteria.applied(),
        list.len(),
    );
    aggregator.set_preview();
    for spec in list.iter() {
        let skip_reason = match criteria.filter_match(spec, list.has_programmatic_focus()) {
            FilterMatch::Mismatch { reason } => Some(reason),
            FilterMatch::Matches | FilterMatch::Pending => None,
        };
        aggregator.record(not_run_report(spec_report(spec, process), None, skip_reason));
    }
    Ok(aggregator.finish())
}

#[derive(Debug)]
struct SuiteRunnerInner<'s> {
    suite: &'s Suite,
    list: SpecList<'s>,
    units: Vec<ExecutionUnit>,
    // Indexed by spec ID.
    matches: Vec<FilterMatch>,
    seed: u64,
    settings: RunSettings,
    parallel: ParallelConfig,
    coordinator: Option<Coordinator>,
    output: OutputInterceptor,
    tracker: ProgressTracker,
    abort: AbortHandle,
    aggregator: ReportAggregator,
    runtime: Runtime,
}

#[derive(Clone, Debug)]
struct RunSettings {
    retry_override: Option<RetryPolicy>,
    poll_defaults: PollProgress,
    default_spec_timeout: Option<Duration>,
    grace_period: Duration,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl RunSettings {
    fn new(config: &SuiteConfig) -> Self {
        Self {
            retry_override: config.retry_override(),
            poll_defaults: config.poll_progress_defaults(),
            default_spec_timeout: config.default_spec_timeout,
            grace_period: config.grace_period,
            fail_fast: config.fail_fast,
            timeout: config.timeout,
        }
    }
}

impl SuiteRunnerInner<'_> {
    async fn execute(
        &self,
        mut signal_handler: SignalHandler,
        callback: &mut (dyn FnMut(SuiteEvent) + Send),
    ) -> SuiteReport {
        let executor = NodeExecutor::new(self.tracker.clone(), self.abort.clone());

        let signal_task = tokio::spawn({
            let abort = self.abort.clone();
            let tracker = self.tracker.clone();
            let reports = executor.report_sender();
            async move {
                while let Some(event) = signal_handler.recv().await {
                    match event {
                        SignalEvent::Shutdown(event) => {
                            warn!("{}, interrupting the run", event.reason());
                            abort.cancel_with_message(event.cancel_reason(), event.reason());
                        }
                        SignalEvent::Info => {
                            if let Some(report) = tracker.snapshot() {
                                // The receiver lives as long as the run.
                                _ = reports.send(report);
                            }
                        }
                    }
                }
            }
        });
        let timeout_task = self.settings.timeout.map(|timeout| {
            let abort = self.abort.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "suite timeout expired");
                abort.cancel(CancelReason::Timeout);
            })
        });

        let mut run = Run {
            inner: self,
            executor,
            sink: EventSink {
                callback,
                stopwatch: stopwatch(),
            },
            cancel_reported: false,
        };
        let report = run.run().await;

        signal_task.abort();
        if let Some(task) = timeout_task {
            task.abort();
        }
        report
    }
}

struct EventSink<'a> {
    callback: &'a mut (dyn FnMut(SuiteEvent) + Send),
    stopwatch: StopwatchStart,
}

impl EventSink<'_> {
    fn emit(&mut self, kind: SuiteEventKind) {
        (self.callback)(SuiteEvent {
            timestamp: Local::now(),
            elapsed: self.stopwatch.elapsed(),
            kind,
        });
    }
}

/// One execution of the suite on this process.
struct Run<'a, 's> {
    inner: &'a SuiteRunnerInner<'s>,
    executor: NodeExecutor,
    sink: EventSink<'a>,
    cancel_reported: bool,
}

impl<'a, 's> Run<'a, 's> {
    #[instrument(
        level = "debug",
        skip_all,
        fields(
            suite = self.inner.suite.name(),
            process = self.inner.parallel.process.get(),
        ),
    )]
    async fn run(&mut self) -> SuiteReport {
        let inner = self.inner;
        let spec_count = inner.matches.iter().filter(|m| m.is_match()).count();
        let total = inner.parallel.total.get();
        debug!(
            "will run {spec_count} {} of {} on {total} {}",
            plural::specs_str(spec_count),
            inner.list.len(),
            plural::processes_str(total),
        );
        self.sink.emit(SuiteEventKind::SuiteStarted {
            suite_name: inner.suite.name().to_owned(),
            seed: inner.seed,
            spec_count,
            process: inner.parallel.process.get(),
            total,
        });

        let registered = match &inner.coordinator {
            Some(coordinator) => match coordinator.register().await {
                Ok(()) => true,
                Err(err) => {
                    self.parallel_failure(err);
                    false
                }
            },
            None => true,
        };

        let setup_passed = registered && self.run_before_suite().await;
        if setup_passed {
            self.run_claimed_units().await;
        }
        self.await_secondaries().await;
        if setup_passed {
            self.run_serial_units().await;
        }
        if registered {
            self.run_after_suite().await;
        }
        self.exchange_reports().await;
        self.finish(setup_passed).await
    }

    // ---
    // Suite-level nodes
    // ---

    async fn run_before_suite(&mut self) -> bool {
        let inner = self.inner;
        let Some(node) = &inner.suite.before_suite else {
            return true;
        };
        let passed = match node {
            BeforeSuiteNode::Plain { location, body } => {
                let body = Arc::clone(&body.0);
                self.run_suite_node(NodeType::BeforeSuite, location, move |ctx| body(ctx))
                    .await
                    .is_some()
            }
            BeforeSuiteNode::Synchronized {
                location,
                primary,
                all,
            } => match self.before_suite_payload(location, primary).await {
                Some(payload) => {
                    let all = Arc::clone(&all.0);
                    self.run_suite_node(NodeType::SynchronizedBeforeSuite, location, move |ctx| {
                        all(ctx, &payload)
                    })
                    .await
                    .is_some()
                }
                None => false,
            },
        };
        if !passed {
            inner
                .aggregator
                .set_suite_failure(SuiteFailure::BeforeSuiteFailed);
        }
        passed
    }

    /// Runs the primary phase of a synchronized before-suite on the primary, or waits for its
    /// payload elsewhere.
    async fn before_suite_payload(
        &mut self,
        location: &CodeLocation,
        primary: &DebugIgnore<PrimaryBody>,
    ) -> Option<Vec<u8>> {
        let inner = self.inner;
        match &inner.coordinator {
            Some(coordinator) if !inner.parallel.is_primary() => {
                match coordinator.await_before_suite().await {
                    Ok(payload) => Some(payload),
                    Err(ParallelError::BeforeSuiteFailed) => {
                        debug!("before-suite failed on the primary process");
                        None
                    }
                    Err(err) => {
                        self.parallel_failure(err);
                        None
                    }
                }
            }
            coordinator => {
                let primary = Arc::clone(&primary.0);
                let payload = self
                    .run_suite_node(NodeType::SynchronizedBeforeSuite, location, move |ctx| {
                        primary(ctx)
                    })
                    .await;
                if let Some(coordinator) = coordinator
                    && let Err(err) = coordinator.post_before_suite(payload.clone()).await
                {
                    self.parallel_failure(err);
                }
                payload
            }
        }
    }

    async fn run_after_suite(&mut self) {
        let inner = self.inner;
        let Some(node) = &inner.suite.after_suite else {
            return;
        };
        let passed = match node {
            AfterSuiteNode::Plain { location, body } => {
                let body = Arc::clone(&body.0);
                self.run_suite_node(NodeType::AfterSuite, location, move |ctx| body(ctx))
                    .await
                    .is_some()
            }
            AfterSuiteNode::Synchronized {
                location,
                all,
                primary,
            } => {
                let all = Arc::clone(&all.0);
                let mut passed = self
                    .run_suite_node(NodeType::SynchronizedAfterSuite, location, move |ctx| {
                        all(ctx)
                    })
                    .await
                    .is_some();
                // Secondaries have finished by now: the primary awaited them before its serial
                // units.
                if inner.parallel.is_primary() {
                    let primary = Arc::clone(&primary.0);
                    passed &= self
                        .run_suite_node(NodeType::SynchronizedAfterSuite, location, move |ctx| {
                            primary(ctx)
                        })
                        .await
                        .is_some();
                }
                passed
            }
        };
        if !passed {
            inner
                .aggregator
                .set_suite_failure(SuiteFailure::AfterSuiteFailed);
        }
    }

    /// Runs a suite-level node with its own context and records its report. Returns the node's
    /// value if it passed.
    async fn run_suite_node<T: Send + 'static>(
        &mut self,
        node_type: NodeType,
        location: &CodeLocation,
        f: impl FnOnce(&SpecContext) -> T + Send + 'static,
    ) -> Option<T> {
        let inner = self.inner;
        let ctx = self.context(1);
        let info = NodeInfo::new(node_type, node_type.name(), location.clone());
        let mut limits = NodeLimits::new(
            inner.settings.poll_defaults,
            None,
            inner.settings.grace_period,
        );
        // A node that starts after an interrupt runs within the grace period.
        limits.observe(&inner.abort);
        let watch = stopwatch();
        inner.output.start();
        inner
            .tracker
            .begin_spec(None, node_type.name().to_owned(), location.clone());

        let node_ctx = ctx.clone();
        let (outcome, value) = self.supervise(&mut limits, &info, move || f(&node_ctx)).await;
        let mut record = AttemptRecord::default();
        record.add(outcome);
        let mut cleanups = ctx.take_cleanups();
        self.run_cleanups(&mut limits, &ctx, &mut cleanups, &mut record)
            .await;

        let passed = self.finish_suite_node(node_type, location, watch, limits, record);
        value.filter(|_| passed)
    }

    fn finish_suite_node(
        &mut self,
        node_type: NodeType,
        location: &CodeLocation,
        watch: StopwatchStart,
        mut limits: NodeLimits,
        record: AttemptRecord,
    ) -> bool {
        let inner = self.inner;
        self.drain_reports(&mut limits);
        let captured = inner.output.stop();
        inner.tracker.end_spec();

        let report = SuiteNodeReport {
            node_type,
            location: location.clone(),
            state: record.state,
            duration: watch.snapshot().duration,
            captured_output: String::from_utf8_lossy(&captured).into_owned(),
            failure: record.failure,
            process: inner.parallel.process.get(),
        };
        let passed = report.state == SpecState::Passed;
        if !passed {
            debug!(node = %node_type, state = report.state.name(), "suite node did not pass");
        }
        inner.aggregator.record_suite_node(report.clone());
        self.sink.emit(SuiteEventKind::SuiteNodeFinished { report });
        passed
    }

    // ---
    // Scheduling
    // ---

    /// Claims and runs units until none are left. In a parallel run serial units are left for the
    /// primary.
    async fn run_claimed_units(&mut self) {
        let inner = self.inner;
        let coordinator = inner.coordinator.as_ref();
        let claimable: Vec<&ExecutionUnit> = inner
            .units
            .iter()
            .filter(|unit| coordinator.is_none() || !unit.is_serial())
            .collect();

        let mut next = 0;
        loop {
            if self.check_cancelled().await {
                break;
            }
            let index = match coordinator {
                Some(coordinator) => match coordinator.claim_unit().await {
                    Ok(index) => index,
                    Err(err) => {
                        self.parallel_failure(err);
                        break;
                    }
                },
                None => {
                    next += 1;
                    next - 1
                }
            };
            let Some(unit) = claimable.get(index) else {
                break;
            };
            self.run_unit(unit).await;
        }
    }

    /// Runs the serial units of a parallel run. Only the primary runs them, after every secondary
    /// has finished.
    async fn run_serial_units(&mut self) {
        let inner = self.inner;
        if inner.coordinator.is_none() || !inner.parallel.is_primary() {
            return;
        }
        for unit in inner.units.iter().filter(|unit| unit.is_serial()) {
            if self.check_cancelled().await {
                break;
            }
            self.run_unit(unit).await;
        }
    }

    async fn await_secondaries(&mut self) {
        let inner = self.inner;
        let Some(coordinator) = &inner.coordinator else {
            return;
        };
        if !inner.parallel.is_primary() {
            return;
        }
        match coordinator.await_secondaries().await {
            Ok(failed) => {
                for process in failed {
                    warn!(process, "parallel process went away without reporting");
                    inner
                        .aggregator
                        .set_suite_failure(SuiteFailure::ParallelProcessFailure {
                            message: format!("process {process} went away without reporting"),
                        });
                }
            }
            Err(err) => self.parallel_failure(err),
        }
    }

    async fn exchange_reports(&mut self) {
        let inner = self.inner;
        let Some(coordinator) = &inner.coordinator else {
            return;
        };
        if inner.parallel.is_primary() {
            match coordinator.collect_reports().await {
                Ok(reports) => inner.aggregator.merge(reports),
                Err(err) => self.parallel_failure(err),
            }
        } else if let Err(err) = coordinator.post_report(inner.aggregator.snapshot()).await {
            self.parallel_failure(err);
        }
    }

    /// Returns true if no further unit should start. Picks up aborts from other processes and
    /// relays local ones.
    async fn check_cancelled(&mut self) -> bool {
        let inner = self.inner;
        if !inner.abort.is_cancelled()
            && let Some(coordinator) = &inner.coordinator
        {
            match coordinator.should_abort().await {
                Ok(true) => {
                    inner.abort.cancel(CancelReason::ParallelAbort);
                }
                Ok(false) => {}
                Err(err) => self.parallel_failure(err),
            }
        }
        match inner.abort.reason() {
            Some(reason) => {
                self.report_cancellation(reason).await;
                true
            }
            None => false,
        }
    }

    async fn report_cancellation(&mut self, reason: CancelReason) {
        if self.cancel_reported {
            return;
        }
        self.cancel_reported = true;
        debug!(%reason, "run cancelled, no further specs will start");
        self.sink.emit(SuiteEventKind::SuiteCancelled { reason });
        if reason != CancelReason::ParallelAbort
            && let Some(coordinator) = &self.inner.coordinator
            && let Err(err) = coordinator.abort().await
        {
            warn!("failed to relay the abort to other processes: {err}");
        }
    }

    fn parallel_failure(&self, err: ParallelError) {
        warn!("parallel coordination failed: {err}");
        let inner = self.inner;
        inner
            .aggregator
            .set_suite_failure(SuiteFailure::ParallelProcessFailure {
                message: err.to_string(),
            });
        inner
            .abort
            .cancel_with_message(CancelReason::ParallelAbort, "Parallel coordination failed");
    }

    async fn finish(&mut self, setup_passed: bool) -> SuiteReport {
        let inner = self.inner;
        if let Some(reason) = inner.abort.reason() {
            self.report_cancellation(reason).await;
            inner
                .aggregator
                .set_suite_failure(SuiteFailure::Cancelled { reason });
        }

        // Specs no process ran are accounted for by the primary once every report is in.
        if inner.parallel.is_primary() {
            for spec in inner
                .list
                .iter()
                .filter(|spec| !inner.aggregator.contains(spec.id()))
            {
                let (state, reason) = match &inner.matches[spec.id().0] {
                    FilterMatch::Pending => (SpecState::Pending, None),
                    FilterMatch::Mismatch { reason } => (SpecState::Skipped, Some(reason.clone())),
                    FilterMatch::Matches if !setup_passed => {
                        (SpecState::Skipped, Some(SkipReason::SuiteSetupFailed))
                    }
                    FilterMatch::Matches => (SpecState::Skipped, Some(SkipReason::Aborted)),
                };
                self.record_not_run(spec, state, reason);
            }
        }

        let report = inner.aggregator.finish();
        debug!(
            passed = report.stats.passed,
            failed = report.stats.failed,
            skipped = report.stats.skipped,
            "suite finished",
        );
        self.sink.emit(SuiteEventKind::SuiteFinished {
            stats: report.stats,
        });
        report
    }

    // ---
    // Units and specs
    // ---

    #[instrument(level = "debug", skip_all, fields(specs = unit.specs().len()))]
    async fn run_unit(&mut self, unit: &ExecutionUnit) {
        let inner = self.inner;
        let specs: Vec<&'a Spec<'s>> = unit
            .specs()
            .iter()
            .filter_map(|id| inner.list.get(*id))
            .collect();
        let runnable = specs
            .iter()
            .filter(|spec| inner.matches[spec.id().0].is_match())
            .copied()
            .collect();
        let mut group = GroupState::new(unit.ordered_group().is_some(), runnable);

        for spec in specs {
            match &inner.matches[spec.id().0] {
                FilterMatch::Pending => self.record_not_run(spec, SpecState::Pending, None),
                FilterMatch::Mismatch { reason } => {
                    self.record_not_run(spec, SpecState::Skipped, Some(reason.clone()));
                }
                FilterMatch::Matches => {
                    group.remaining.pop_front();
                    if inner.abort.is_cancelled() {
                        self.record_not_run(spec, SpecState::Skipped, Some(SkipReason::Aborted));
                    } else if group.failed {
                        self.record_not_run(
                            spec,
                            SpecState::Skipped,
                            Some(SkipReason::EarlierOrderedFailure),
                        );
                    } else {
                        let report = self.run_spec(spec, &mut group).await;
                        if report.state.is_some_and(|state| state.is_failure()) {
                            group.failed = group.ordered;
                            if inner.settings.fail_fast {
                                inner.abort.cancel(CancelReason::FailFast);
                            }
                        }
                        self.record(report);
                    }
                }
            }
        }

        self.flush_group(&mut group).await;
    }

    #[instrument(level = "debug", skip_all, fields(spec = %spec.full_text()))]
    async fn run_spec(&mut self, spec: &'a Spec<'s>, group: &mut GroupState<'a, 's>) -> SpecReport {
        let inner = self.inner;
        let mut retry = RetryController::new(spec.retry_policy(), inner.settings.retry_override);
        self.sink.emit(SuiteEventKind::SpecStarted {
            spec_id: spec.id(),
            text: spec.full_text(),
        });

        let mut report = spec_report(spec, inner.parallel.process.get());
        loop {
            let index = retry.begin_attempt();
            let (attempt, skip_reason) = self.run_attempt(spec, index, &retry, group).await;
            let will_retry = retry.should_retry(attempt.state) && !inner.abort.is_cancelled();
            if attempt.state.is_failure() {
                debug!(
                    attempt = index,
                    state = attempt.state.name(),
                    will_retry,
                    "attempt failed",
                );
                self.sink.emit(SuiteEventKind::AttemptFailed {
                    spec_id: spec.id(),
                    attempt: attempt.clone(),
                    will_retry,
                });
            }
            report.skip_reason = skip_reason;
            report.attempts.push(attempt);
            if !will_retry {
                break;
            }
        }

        if let (Some(first), Some(last)) = (report.attempts.first(), report.attempts.last()) {
            report.start_time = Some(first.start_time);
            report.state = Some(last.state);
            report.failure = last.failure.clone();
        }
        report.run_time = report.attempts.iter().map(|attempt| attempt.duration).sum();
        report
    }

    async fn run_attempt(
        &mut self,
        spec: &'a Spec<'s>,
        index: u32,
        retry: &RetryController,
        group: &mut GroupState<'a, 's>,
    ) -> (RunAttempt, Option<SkipReason>) {
        let inner = self.inner;
        let settings = &inner.settings;
        let watch = stopwatch();
        inner.output.start();
        inner
            .tracker
            .begin_spec(Some(spec.id()), spec.full_text(), spec.location().clone());
        let ctx = self.context(index);
        let mut limits = NodeLimits::new(
            spec.poll_progress().or(settings.poll_defaults),
            spec.spec_timeout().or(settings.default_spec_timeout),
            settings.grace_period,
        );
        let mut record = AttemptRecord::default();
        let mut cleanups = Vec::new();
        let containers = spec.containers();

        // Setup, outermost container first. Every level up to the one that failed is torn down.
        let mut reached = 0;
        'setup: for &container in containers {
            reached += 1;
            group.enter(container);
            for kind in [HookKind::BeforeAll, HookKind::BeforeEach] {
                for hook in container.hooks_of(kind) {
                    let proceed = self
                        .run_setup_hook(
                            &mut limits,
                            &ctx,
                            spec,
                            container,
                            hook,
                            group,
                            &mut record,
                        )
                        .await;
                    if !proceed {
                        break 'setup;
                    }
                    if !group.is_scoped(hook) {
                        cleanups.extend(ctx.take_cleanups());
                    }
                }
            }
        }

        if record.passed() {
            'just: for &container in containers {
                for hook in container.hooks_of(HookKind::JustBeforeEach) {
                    let proceed = self
                        .run_setup_hook(
                            &mut limits,
                            &ctx,
                            spec,
                            container,
                            hook,
                            group,
                            &mut record,
                        )
                        .await;
                    if !proceed {
                        break 'just;
                    }
                    if !group.is_scoped(hook) {
                        cleanups.extend(ctx.take_cleanups());
                    }
                }
            }
        }

        if record.passed()
            && !self.interrupted(&mut limits, spec, &mut record)
            && let Some(body) = spec.leaf().body()
        {
            let body = Arc::clone(body);
            let info = NodeInfo::new(NodeType::It, spec.text(), spec.location().clone());
            let outcome = self
                .run_node(&mut limits, &ctx, &info, move |ctx| body(ctx))
                .await;
            record.add(outcome);
            cleanups.extend(ctx.take_cleanups());
        }

        // A hook that stopped setup may have registered cleanups before failing.
        cleanups.extend(ctx.take_cleanups());

        // Teardown, innermost container first. Group-scoped hooks only run once the group is done
        // with the container.
        let cancelled = inner.abort.is_cancelled();
        let final_attempt = cancelled || !retry.should_retry(record.state);
        let ends_group =
            final_attempt && (cancelled || (group.ordered && record.state.is_failure()));
        let levels: Vec<(&'s TreeNode, bool)> = containers[..reached]
            .iter()
            .map(|&container| {
                let tear_down = ends_group || (final_attempt && group.is_last_in(container));
                (container, tear_down)
            })
            .collect();

        for kind in [HookKind::JustAfterEach, HookKind::AfterEach] {
            for &(container, tear_down) in levels.iter().rev() {
                for hook in container.hooks_of(kind) {
                    if group.is_scoped(hook) && !tear_down {
                        continue;
                    }
                    let outcome = self.run_hook(&mut limits, &ctx, hook).await;
                    record.add(outcome);
                    cleanups.extend(ctx.take_cleanups());
                }
            }
        }
        self.run_cleanups(&mut limits, &ctx, &mut cleanups, &mut record)
            .await;

        for &(container, tear_down) in levels.iter().rev() {
            if tear_down && group.is_open(container) {
                let kinds = [HookKind::AfterAll];
                self.tear_down_group(&mut limits, &ctx, container, group, &kinds, &mut record)
                    .await;
            }
        }

        self.drain_reports(&mut limits);
        let captured = inner.output.stop();
        inner.tracker.end_spec();
        let snapshot = watch.snapshot();
        let attempt = RunAttempt {
            index,
            state: record.state,
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            captured_output: String::from_utf8_lossy(&captured).into_owned(),
            progress_reports: limits.take_progress_reports(),
            failure: record.failure,
            additional_failures: record.additional_failures,
        };
        (attempt, record.skip_reason)
    }

    /// Runs a setup hook unless it is group-scoped and already ran. Returns false if setup should
    /// stop.
    #[expect(clippy::too_many_arguments)]
    async fn run_setup_hook(
        &mut self,
        limits: &mut NodeLimits,
        ctx: &SpecContext,
        spec: &Spec<'_>,
        container: &TreeNode,
        hook: &Hook,
        group: &mut GroupState<'a, 's>,
        record: &mut AttemptRecord,
    ) -> bool {
        let scoped = group.is_scoped(hook);
        if scoped && group.ran.contains(&hook.id) {
            return true;
        }
        if self.interrupted(limits, spec, record) {
            return false;
        }
        let outcome = self.run_hook(limits, ctx, hook).await;
        let passed = outcome == NodeOutcome::Passed;
        record.add(outcome);
        if scoped {
            group
                .cleanups
                .entry(container.id())
                .or_default()
                .extend(ctx.take_cleanups());
            if passed {
                group.ran.insert(hook.id);
            }
        }
        record.passed()
    }

    /// Runs the group-scoped teardown of `container`: the scoped hooks of `kinds`, then the
    /// cleanups registered by its group-scoped hooks, last registered first.
    async fn tear_down_group(
        &mut self,
        limits: &mut NodeLimits,
        ctx: &SpecContext,
        container: &'s TreeNode,
        group: &mut GroupState<'a, 's>,
        kinds: &[HookKind],
        record: &mut AttemptRecord,
    ) {
        for &kind in kinds {
            for hook in container.hooks_of(kind) {
                if group.is_scoped(hook) {
                    let outcome = self.run_hook(limits, ctx, hook).await;
                    record.add(outcome);
                }
            }
        }
        let mut cleanups = group.close(container);
        cleanups.extend(ctx.take_cleanups());
        self.run_cleanups(limits, ctx, &mut cleanups, record).await;
    }

    /// Runs the group-scoped teardown still owed when a unit ends before its last spec ran.
    async fn flush_group(&mut self, group: &mut GroupState<'a, 's>) {
        let inner = self.inner;
        let Some(outermost) = group.open.first().copied() else {
            return;
        };
        debug!(containers = group.open.len(), "running leftover group teardown");
        let ctx = self.context(1);
        let mut limits = NodeLimits::new(
            inner.settings.poll_defaults,
            None,
            inner.settings.grace_period,
        );
        limits.observe(&inner.abort);
        let watch = stopwatch();
        inner.output.start();
        inner.tracker.begin_spec(
            None,
            NodeType::AfterAll.name().to_owned(),
            outermost.location().clone(),
        );

        let mut record = AttemptRecord::default();
        let kinds = [
            HookKind::JustAfterEach,
            HookKind::AfterEach,
            HookKind::AfterAll,
        ];
        while let Some(container) = group.open.last().copied() {
            self.tear_down_group(&mut limits, &ctx, container, group, &kinds, &mut record)
                .await;
        }
        self.finish_suite_node(NodeType::AfterAll, outermost.location(), watch, limits, record);
    }

    /// Checks for an interrupt before a setup node or the body starts, and records it on the
    /// attempt.
    fn interrupted(
        &self,
        limits: &mut NodeLimits,
        spec: &Spec<'_>,
        record: &mut AttemptRecord,
    ) -> bool {
        if let Some(cancellation) = limits.observe(&self.inner.abort) {
            let info = NodeInfo::new(NodeType::It, spec.text(), spec.location().clone());
            record.add(NodeOutcome::Interrupted(info.failure(
                cancellation.message,
                None,
                None,
            )));
        }
        limits.interruption().is_some()
    }

    // ---
    // Nodes
    // ---

    async fn run_hook(
        &mut self,
        limits: &mut NodeLimits,
        ctx: &SpecContext,
        hook: &Hook,
    ) -> NodeOutcome {
        let node_type = hook.kind().node_type();
        let info = NodeInfo::new(node_type, node_type.name(), hook.location().clone());
        let body = Arc::clone(&hook.body.0);
        self.run_node(limits, ctx, &info, move |ctx| body(ctx)).await
    }

    /// Runs cleanups last registered first, including cleanups they register themselves.
    async fn run_cleanups(
        &mut self,
        limits: &mut NodeLimits,
        ctx: &SpecContext,
        cleanups: &mut Vec<Cleanup>,
        record: &mut AttemptRecord,
    ) {
        while let Some(Cleanup { location, body }) = cleanups.pop() {
            let node_type = NodeType::DeferCleanup;
            let info = NodeInfo::new(node_type, node_type.name(), location);
            let DebugIgnore(body) = body;
            let outcome = self.run_node(limits, ctx, &info, move |ctx| body(ctx)).await;
            record.add(outcome);
            cleanups.extend(ctx.take_cleanups());
        }
    }

    async fn run_node(
        &mut self,
        limits: &mut NodeLimits,
        ctx: &SpecContext,
        info: &NodeInfo,
        body: impl FnOnce(&SpecContext) + Send + 'static,
    ) -> NodeOutcome {
        let ctx = ctx.clone();
        self.supervise(limits, info, move || body(&ctx)).await.0
    }

    async fn supervise<T: Send + 'static>(
        &mut self,
        limits: &mut NodeLimits,
        info: &NodeInfo,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> (NodeOutcome, Option<T>) {
        let Self {
            inner,
            executor,
            sink,
            ..
        } = self;
        let (outcome, value) = executor
            .run(limits, info, &mut |kind: SuiteEventKind| sink.emit(kind), f)
            .await;
        if let NodeOutcome::Aborted(failure) = &outcome {
            debug!(message = %failure.message, "suite aborted from a node");
            inner.abort.cancel(CancelReason::SuiteAbort);
        }
        (outcome, value)
    }

    fn drain_reports(&mut self, limits: &mut NodeLimits) {
        let Self { executor, sink, .. } = self;
        executor.drain_reports(limits, &mut |kind: SuiteEventKind| sink.emit(kind));
    }

    fn context(&self, attempt: u32) -> SpecContext {
        let inner = self.inner;
        SpecContext::new(
            inner.output.clone(),
            inner.tracker.clone(),
            self.executor.report_sender(),
            attempt,
            inner.parallel.process.get(),
            inner.parallel.total.get(),
        )
    }

    fn record(&mut self, report: SpecReport) {
        self.inner.aggregator.record(report.clone());
        self.sink.emit(SuiteEventKind::SpecFinished { report });
    }

    fn record_not_run(&mut self, spec: &Spec<'_>, state: SpecState, reason: Option<SkipReason>) {
        let report = spec_report(spec, self.inner.parallel.process.get());
        self.record(not_run_report(report, Some(state), reason));
    }
}

fn spec_report(spec: &Spec<'_>, process: usize) -> SpecReport {
    SpecReport {
        spec_id: spec.id(),
        container_texts: spec.container_texts().map(str::to_owned).collect(),
        text: spec.text().to_owned(),
        location: spec.location().clone(),
        labels: spec.labels().to_vec(),
        state: None,
        skip_reason: None,
        attempts: Vec::new(),
        failure: None,
        start_time: None,
        run_time: Duration::ZERO,
        process,
    }
}

/// State shared by the specs of one scheduling unit.
#[derive(Debug)]
struct GroupState<'a, 's> {
    ordered: bool,
    // Runnable specs that have not started yet.
    remaining: VecDeque<&'a Spec<'s>>,
    failed: bool,
    // Group-scoped setup hooks that ran successfully.
    ran: HashSet<NodeId>,
    // Containers whose group-scoped teardown is still owed, outermost first.
    open: Vec<&'s TreeNode>,
    cleanups: HashMap<NodeId, Vec<Cleanup>>,
}

impl<'a, 's> GroupState<'a, 's> {
    fn new(ordered: bool, runnable: VecDeque<&'a Spec<'s>>) -> Self {
        Self {
            ordered,
            remaining: runnable,
            failed: false,
            ran: HashSet::new(),
            open: Vec::new(),
            cleanups: HashMap::new(),
        }
    }

    /// Returns true if the hook runs once for the unit rather than once per spec.
    fn is_scoped(&self, hook: &Hook) -> bool {
        matches!(hook.kind(), HookKind::BeforeAll | HookKind::AfterAll)
            || (self.ordered && hook.is_once_per_ordered())
    }

    fn enter(&mut self, container: &'s TreeNode) {
        if !self.is_open(container) && container.hooks().iter().any(|hook| self.is_scoped(hook)) {
            self.open.push(container);
        }
    }

    fn is_open(&self, container: &TreeNode) -> bool {
        self.open.iter().any(|open| open.id() == container.id())
    }

    /// Returns true if no spec still to come runs inside `container`.
    fn is_last_in(&self, container: &TreeNode) -> bool {
        !self.remaining.iter().any(|spec| {
            spec.containers()
                .iter()
                .any(|other| other.id() == container.id())
        })
    }

    /// Marks the container's group-scoped teardown as done and returns the cleanups registered by
    /// its group-scoped hooks.
    fn close(&mut self, container: &TreeNode) -> Vec<Cleanup> {
        self.open.retain(|open| open.id() != container.id());
        for hook in container.hooks() {
            self.ran.remove(&hook.id);
        }
        self.cleanups.remove(&container.id()).unwrap_or_default()
    }
}

/// The combined outcome of the nodes of one attempt.
#[derive(Debug)]
struct AttemptRecord {
    state: SpecState,
    failure: Option<Failure>,
    additional_failures: Vec<Failure>,
    skip_reason: Option<SkipReason>,
}

impl Default for AttemptRecord {
    fn default() -> Self {
        Self {
            state: SpecState::Passed,
            failure: None,
            additional_failures: Vec::new(),
            skip_reason: None,
        }
    }
}

impl AttemptRecord {
    fn passed(&self) -> bool {
        self.state == SpecState::Passed
    }

    /// Folds in the outcome of one node. The first failure decides the state, later ones are
    /// kept as additional failures. A skip only counts while nothing has failed.
    fn add(&mut self, outcome: NodeOutcome) {
        let state = outcome.state();
        match outcome {
            NodeOutcome::Passed => {}
            NodeOutcome::Skipped { message } => {
                if self.passed() {
                    self.state = SpecState::Skipped;
                    self.skip_reason = Some(SkipReason::SkippedByBody { message });
                }
            }
            outcome => {
                let failure = outcome.into_failure();
                if self.state.is_failure() {
                    self.additional_failures.extend(failure);
                } else {
                    self.state = state;
                    self.failure = failure;
                    self.skip_reason = None;
                }
            }
        }
    }
}
