// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use color_eyre::eyre::Result;
use std::sync::{Arc, Mutex, Once};
use trellis_runner::{
    config::SuiteConfig,
    output::CaptureStrategy,
    reporter::{SuiteEvent, SuiteEventKind},
    runner::{SpecContext, SuiteOutcome, SuiteRunnerBuilder},
    signal::SignalHandlerKind,
    tree::Suite,
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = color_eyre::install();
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A config with a fixed seed that only captures writer output, so test harness output isn't
/// swallowed.
pub(crate) fn test_config() -> SuiteConfig {
    let mut config = SuiteConfig::default();
    config.seed = Some(7);
    config.capture = CaptureStrategy::WriterOnly;
    config
}

pub(crate) fn run_suite(
    suite: &Suite,
    config: &SuiteConfig,
) -> Result<(SuiteOutcome, Vec<SuiteEvent>)> {
    run_suite_with(SuiteRunnerBuilder::default(), suite, config)
}

pub(crate) fn run_suite_with(
    builder: SuiteRunnerBuilder,
    suite: &Suite,
    config: &SuiteConfig,
) -> Result<(SuiteOutcome, Vec<SuiteEvent>)> {
    let runner = builder.build(suite, config, SignalHandlerKind::Noop)?;
    let mut events = Vec::new();
    let outcome = runner.execute(|event| events.push(event));
    Ok((outcome, events))
}

pub(crate) fn attempt_failures(events: &[SuiteEvent]) -> Vec<(u32, bool)> {
    events
        .iter()
        .filter_map(|event| match &event.kind {
            SuiteEventKind::AttemptFailed {
                attempt,
                will_retry,
                ..
            } => Some((attempt.index, *will_retry)),
            _ => None,
        })
        .collect()
}

/// An ordered log of what the nodes of a suite did.
#[derive(Clone, Debug, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn log(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Returns a node body that logs `entry`.
    pub(crate) fn logger(
        &self,
        entry: &'static str,
    ) -> impl Fn(&SpecContext) + Send + Sync + 'static {
        let journal = self.clone();
        move |_| journal.log(entry)
    }
}
