// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::{thread, time::Duration};
use trellis_runner::{
    location,
    reporter::{CancelReason, SkipReason, SpecState, SuiteFailure},
    runner::{SpecContext, SuiteRunnerBuilder},
    signal::SignalHandlerKind,
    tree::{Decorator, SuiteBuilder},
};

fn sleeper(millis: u64) -> impl Fn(&SpecContext) + Send + Sync + 'static {
    move |_| thread::sleep(Duration::from_millis(millis))
}

#[test]
fn spec_timeout_times_out_and_still_tears_down() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("spec timeout");
    builder.container("jobs", location!(), [], |b| {
        b.after_each(location!(), [], journal.logger("after"));
        b.leaf(
            "hangs",
            location!(),
            [Decorator::SpecTimeout(Duration::from_millis(100))],
            sleeper(2_000),
        );
        b.leaf("finishes", location!(), [], journal.logger("finishes"));
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed);
    assert_eq!(journal.count("after"), 2);
    assert_eq!(journal.count("finishes"), 1, "a spec timeout doesn't stop the run");
    let report = outcome.report.spec_by_text("hangs").expect("spec is reported");
    assert_eq!(report.state, Some(SpecState::Timedout));
    assert!(report.run_time < Duration::from_secs(2));
    assert_eq!(outcome.report.suite_failure, None);
    Ok(())
}

#[test]
fn default_spec_timeout_applies_without_a_decorator() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("default timeout");
    builder.leaf("hangs", location!(), [], sleeper(2_000));
    builder.leaf(
        "has its own deadline",
        location!(),
        [Decorator::SpecTimeout(Duration::from_secs(30))],
        sleeper(300),
    );
    let suite = builder.build()?;

    let mut config = test_config();
    config.default_spec_timeout = Some(Duration::from_millis(100));
    let (outcome, _) = run_suite(&suite, &config)?;

    let state = |text| outcome.report.spec_by_text(text).and_then(|r| r.state);
    assert_eq!(state("hangs"), Some(SpecState::Timedout));
    assert_eq!(state("has its own deadline"), Some(SpecState::Passed));
    Ok(())
}

#[test]
fn suite_timeout_interrupts_the_running_spec() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("suite timeout");
    builder.container("pipeline", location!(), [Decorator::Ordered], |b| {
        b.after_each(location!(), [], journal.logger("after"));
        b.leaf("is slow", location!(), [], sleeper(600));
        b.leaf("never starts", location!(), [], journal.logger("never starts"));
    });
    let suite = builder.build()?;

    let mut config = test_config();
    config.timeout = Some(Duration::from_millis(150));
    let (outcome, _) = run_suite(&suite, &config)?;

    assert!(!outcome.passed);
    assert_eq!(journal.entries(), ["after"], "teardown runs after an interrupt");
    let report = &outcome.report;
    let slow = report.spec_by_text("is slow").expect("spec is reported");
    assert_eq!(slow.state, Some(SpecState::Interrupted));
    assert_eq!(
        slow.failure.as_ref().map(|f| f.message.as_str()),
        Some("Interrupted by suite timeout")
    );
    let next = report.spec_by_text("never starts").expect("spec is reported");
    assert_eq!(next.skip_reason, Some(SkipReason::Aborted));
    assert_eq!(
        report.suite_failure,
        Some(SuiteFailure::Cancelled {
            reason: CancelReason::Timeout
        })
    );
    Ok(())
}

#[test]
fn abort_handle_interrupts_from_another_thread() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("user interrupt");
    builder.container("steps", location!(), [Decorator::Ordered], |b| {
        b.leaf("waits", location!(), [], sleeper(500));
        b.leaf("follows", location!(), [], |_| {});
    });
    let suite = builder.build()?;

    let runner =
        SuiteRunnerBuilder::default().build(&suite, &test_config(), SignalHandlerKind::Noop)?;
    let handle = runner.abort_handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.interrupt();
    });
    let outcome = runner.execute(|_| {});
    interrupter.join().expect("interrupter thread panicked");

    let report = &outcome.report;
    let waits = report.spec_by_text("waits").expect("spec is reported");
    assert_eq!(waits.state, Some(SpecState::Interrupted));
    assert_eq!(
        waits.failure.as_ref().map(|f| f.message.as_str()),
        Some("Interrupted by User")
    );
    assert_eq!(
        report.spec_by_text("follows").and_then(|r| r.skip_reason.clone()),
        Some(SkipReason::Aborted)
    );
    assert_eq!(
        report.suite_failure,
        Some(SuiteFailure::Cancelled {
            reason: CancelReason::Interrupt
        })
    );
    Ok(())
}

#[test]
fn abort_lets_the_running_spec_finish() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("user abort");
    builder.container("steps", location!(), [Decorator::Ordered], |b| {
        b.leaf("waits", location!(), [], sleeper(300));
        b.leaf("follows", location!(), [], |_| {});
    });
    let suite = builder.build()?;

    let runner =
        SuiteRunnerBuilder::default().build(&suite, &test_config(), SignalHandlerKind::Noop)?;
    let handle = runner.abort_handle();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.abort();
    });
    let outcome = runner.execute(|_| {});
    aborter.join().expect("aborter thread panicked");

    let state = |text| outcome.report.spec_by_text(text).and_then(|r| r.state);
    assert_eq!(state("waits"), Some(SpecState::Passed));
    assert_eq!(state("follows"), Some(SpecState::Skipped));
    assert!(!outcome.passed, "an aborted run fails");
    Ok(())
}
