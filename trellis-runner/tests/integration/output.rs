// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::{io::Write, thread, time::Duration};
use trellis_runner::{
    location,
    reporter::{SpecState, SuiteEventKind},
    tree::{Decorator, NodeType, SuiteBuilder},
};

#[test]
fn writer_output_is_attributed_to_the_attempt() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("output");
    builder.container("renderer", location!(), [], |b| {
        b.before_each(location!(), [], |ctx| {
            writeln!(ctx.writer(), "loading templates").unwrap();
        });
        b.leaf("renders", location!(), [], |ctx| {
            writeln!(ctx.writer(), "rendered 3 pages").unwrap();
        });
        b.leaf("fails loudly", location!(), [], |ctx| {
            writeln!(ctx.writer(), "about to fail").unwrap();
            ctx.fail("template missing");
        });
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    let output = |text| {
        outcome
            .report
            .spec_by_text(text)
            .map(|report| report.attempts[0].captured_output.clone())
    };
    assert_eq!(
        output("renders").as_deref(),
        Some("loading templates\nrendered 3 pages\n")
    );
    assert_eq!(
        output("fails loudly").as_deref(),
        Some("loading templates\nabout to fail\n")
    );
    Ok(())
}

#[test]
fn paused_output_is_not_captured() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("pausing");
    builder.leaf("talks to the terminal", location!(), [], |ctx| {
        write!(ctx.writer(), "a").unwrap();
        let outer = ctx.pause_output();
        let inner = ctx.pause_output();
        write!(ctx.writer(), "b").unwrap();
        drop(inner);
        write!(ctx.writer(), "c").unwrap();
        drop(outer);
        write!(ctx.writer(), "d").unwrap();
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    let report = outcome
        .report
        .spec_by_text("talks to the terminal")
        .expect("spec is reported");
    assert_eq!(report.attempts[0].captured_output, "ad");
    Ok(())
}

#[test]
fn progress_report_on_request() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("progress");
    let logger = journal.clone();
    builder.leaf("imports data", location!(), [], move |ctx| {
        ctx.by("parsing rows");
        writeln!(ctx.writer(), "parsed 10 rows").unwrap();
        let _guard = ctx.add_progress_reporter(|| "queue depth: 3".to_owned());
        let report = ctx.progress_report().expect("a spec is running");
        logger.log(report.spec_text);
    });
    let suite = builder.build()?;

    let (outcome, events) = run_suite(&suite, &test_config())?;

    assert_eq!(journal.entries(), ["imports data"]);
    let reports: Vec<_> = events
        .iter()
        .filter_map(|event| match &event.kind {
            SuiteEventKind::ProgressReport { report } => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    let report = reports[0];
    assert_eq!(
        report.current_step.as_ref().map(|step| step.text.as_str()),
        Some("parsing rows")
    );
    assert_eq!(
        report.current_node.as_ref().map(|node| node.node_type),
        Some(NodeType::It)
    );
    assert_eq!(report.captured_output, "parsed 10 rows\n");
    assert_eq!(report.additional_reports, ["queue depth: 3"]);

    let spec = outcome.report.spec_by_text("imports data").expect("spec is reported");
    assert_eq!(spec.attempts[0].progress_reports.len(), 1);
    Ok(())
}

#[test]
fn slow_specs_emit_progress_reports() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("polling");
    builder.leaf(
        "waits for the queue",
        location!(),
        [
            Decorator::PollProgressAfter(Duration::from_millis(50)),
            Decorator::PollProgressInterval(Duration::from_millis(50)),
        ],
        |ctx| {
            ctx.by("waiting");
            thread::sleep(Duration::from_millis(400));
        },
    );
    builder.leaf("is quick", location!(), [], |_| {});
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    let slow = outcome
        .report
        .spec_by_text("waits for the queue")
        .expect("spec is reported");
    assert_eq!(slow.state, Some(SpecState::Passed));
    assert!(
        slow.attempts[0].progress_reports.len() >= 2,
        "reports repeat at the interval"
    );
    let quick = outcome.report.spec_by_text("is quick").expect("spec is reported");
    assert!(quick.attempts[0].progress_reports.is_empty());
    Ok(())
}
