// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, bail};
use pretty_assertions::assert_eq;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use test_case::test_case;
use trellis_runner::{
    errors::{DecoratorMisuseKind, FilterBuildError, SuiteRunnerBuildError},
    list::SpecList,
    location,
    reporter::{CancelReason, SkipReason, SpecState, SuiteEventKind, SuiteFailure},
    runner::{SpecContext, SuiteRunnerBuilder, preview},
    signal::SignalHandlerKind,
    tree::{Decorator, NodeType, SuiteBuilder, TableEntry},
};

#[test]
fn hooks_wrap_the_body_in_declaration_order() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("hooks");
    builder.container("outer", location!(), [], |b| {
        b.before_each(location!(), [], journal.logger("outer before"));
        b.just_before_each(location!(), [], journal.logger("outer just before"));
        b.just_after_each(location!(), [], journal.logger("outer just after"));
        b.after_each(location!(), [], journal.logger("outer after"));
        b.container("inner", location!(), [], |b| {
            b.before_each(location!(), [], journal.logger("inner before"));
            b.after_each(location!(), [], journal.logger("inner after"));
            let journal = journal.clone();
            b.leaf("works", location!(), [], move |ctx| {
                journal.log("body");
                let journal = journal.clone();
                ctx.defer_cleanup(move |_| journal.log("cleanup"));
            });
        });
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed, "suite passed");
    assert_eq!(
        journal.entries(),
        [
            "outer before",
            "inner before",
            "outer just before",
            "body",
            "outer just after",
            "inner after",
            "outer after",
            "cleanup",
        ]
    );
    let report = outcome.report.spec_by_text("works").expect("spec is reported");
    assert_eq!(report.state, Some(SpecState::Passed));
    assert_eq!(report.full_text(), "outer inner works");
    assert_eq!(report.attempts.len(), 1);
    Ok(())
}

#[test]
fn failures_are_attributed_to_their_node() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("failures");
    builder.container("accounts", location!(), [], |b| {
        b.after_each(location!(), [], journal.logger("after"));
        b.leaf("fails", location!(), [], |ctx| ctx.fail("balance mismatch"));
        b.leaf("panics", location!(), [], |_| panic!("index out of bounds"));
        b.leaf("passes", location!(), [], |_| {});
    });
    let suite = builder.build()?;

    let (outcome, events) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed, "suite failed");
    assert_eq!(journal.count("after"), 3, "teardown runs after every spec");

    let failed = outcome.report.spec_by_text("fails").expect("spec is reported");
    assert_eq!(failed.state, Some(SpecState::Failed));
    let failure = failed.failure.as_ref().expect("failure is recorded");
    assert_eq!(failure.message, "balance mismatch");
    assert_eq!(failure.node_type, NodeType::It);
    assert!(failure.location.file.ends_with("basic.rs"));

    let panicked = outcome.report.spec_by_text("panics").expect("spec is reported");
    assert_eq!(panicked.state, Some(SpecState::Panicked));
    let failure = panicked.failure.as_ref().expect("failure is recorded");
    assert!(failure.message.contains("index out of bounds"));
    assert!(failure.backtrace.is_some(), "panics carry a backtrace");

    let stats = outcome.report.stats;
    assert_eq!((stats.total, stats.passed, stats.failed), (3, 1, 2));

    let finished = events
        .iter()
        .filter(|event| matches!(event.kind, SuiteEventKind::SpecFinished { .. }))
        .count();
    assert_eq!(finished, 3);
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(SuiteEventKind::SuiteFinished { .. })
    ));
    Ok(())
}

#[test]
fn skip_from_the_body_records_the_message() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("skips");
    builder.leaf("needs a database", location!(), [], |ctx| {
        ctx.skip("no database available")
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed, "skipping doesn't fail the suite");
    let report = outcome.report.spec_by_text("needs a database").expect("spec is reported");
    assert_eq!(report.state, Some(SpecState::Skipped));
    assert_eq!(
        report.skip_reason,
        Some(SkipReason::SkippedByBody {
            message: "no database available".to_owned()
        })
    );
    Ok(())
}

#[test]
fn pending_is_inherited_through_nested_containers() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("pending");
    builder.container("outer", location!(), [Decorator::Pending], |b| {
        b.container("middle", location!(), [], |b| {
            b.before_each(location!(), [], journal.logger("before"));
            b.leaf("deep", location!(), [], journal.logger("deep"));
        });
    });
    builder.leaf("sibling", location!(), [], journal.logger("sibling"));
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed, "pending specs don't fail the suite");
    assert_eq!(journal.entries(), ["sibling"]);
    let deep = outcome.report.spec_by_text("deep").expect("spec is reported");
    assert_eq!(deep.state, Some(SpecState::Pending));
    assert!(deep.attempts.is_empty());
    assert_eq!(outcome.report.stats.pending, 1);
    Ok(())
}

#[test]
fn programmatic_focus_skips_unfocused_specs() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("focus");
    builder.container("checkout", location!(), [Decorator::Focus], |b| {
        b.leaf("charges the card", location!(), [], journal.logger("charges"));
    });
    builder.leaf("sends a receipt", location!(), [], journal.logger("receipt"));
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert_eq!(journal.entries(), ["charges"]);
    let skipped = outcome.report.spec_by_text("sends a receipt").expect("spec is reported");
    assert_eq!(skipped.state, Some(SpecState::Skipped));
    assert_eq!(skipped.skip_reason, Some(SkipReason::Focus));
    Ok(())
}

#[test]
fn pending_ancestor_dominates_focused_descendant() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("pending and focus");
    builder.container("legacy", location!(), [Decorator::Pending], |b| {
        b.container("importer", location!(), [], |b| {
            b.leaf("focused", location!(), [Decorator::Focus], journal.logger("focused"));
        });
    });
    builder.leaf("unfocused", location!(), [], journal.logger("unfocused"));
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(journal.entries().is_empty());
    let report = &outcome.report;
    assert_eq!(
        report.spec_by_text("focused").and_then(|r| r.state),
        Some(SpecState::Pending)
    );
    // The focus still counts, so the rest of the suite is skipped.
    let unfocused = report.spec_by_text("unfocused").expect("spec is reported");
    assert_eq!(unfocused.skip_reason, Some(SkipReason::Focus));
    Ok(())
}

#[test]
fn innermost_focus_narrows_an_outer_focus() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("nested focus");
    builder.container("search", location!(), [Decorator::Focus], |b| {
        b.leaf("ranks", location!(), [Decorator::Focus], journal.logger("ranks"));
        b.leaf("paginates", location!(), [], journal.logger("paginates"));
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert_eq!(journal.entries(), ["ranks"]);
    let paginates = outcome.report.spec_by_text("paginates").expect("spec is reported");
    assert_eq!(paginates.skip_reason, Some(SkipReason::Focus));
    Ok(())
}

#[test]
fn decorator_misuse_is_collected_before_anything_runs() {
    test_init();

    let counter = Arc::new(AtomicUsize::new(0));
    let body = {
        let counter = Arc::clone(&counter);
        move |_: &SpecContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    };

    let mut builder = SuiteBuilder::new("misuse");
    builder.leaf(
        "focused and pending",
        location!(),
        [Decorator::Focus, Decorator::Pending],
        body.clone(),
    );
    builder.leaf(
        "retried two ways",
        location!(),
        [Decorator::FlakeAttempts(2), Decorator::MustPassRepeatedly(2)],
        body.clone(),
    );
    builder.leaf("fine", location!(), [], body);

    let err = match builder.build() {
        Ok(_) => panic!("misuse is rejected"),
        Err(err) => err,
    };
    assert_eq!(err.suite_name, "misuse");
    let texts: Vec<_> = err.errors.iter().map(|e| e.node_text.as_str()).collect();
    assert_eq!(texts, ["focused and pending", "retried two ways"]);
    assert!(matches!(err.errors[0].kind, DecoratorMisuseKind::FocusAndPending));
    assert!(matches!(err.errors[1].kind, DecoratorMisuseKind::FlakeAndRepeat));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn invalid_semver_filter_fails_the_build() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("semver");
    builder.leaf(
        "uses the new API",
        location!(),
        [Decorator::semver(">=2.0.0")],
        journal.logger("ran"),
    );
    let suite = builder.build()?;

    let mut config = test_config();
    config.semver_filter = "not a version".to_owned();
    let result = SuiteRunnerBuilder::default().build(&suite, &config, SignalHandlerKind::Noop);

    match result {
        Err(SuiteRunnerBuildError::Filter(FilterBuildError::SemVer(_))) => {}
        Err(other) => bail!("unexpected error: {other}"),
        Ok(_) => bail!("an invalid filter version is rejected"),
    }
    assert!(journal.entries().is_empty());
    Ok(())
}

#[test_case("1.5.0", SpecState::Skipped; "below the constraint")]
#[test_case("2.3.0", SpecState::Passed; "within the constraint")]
fn semver_filter_selects_specs(version: &str, expected: SpecState) -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("semver");
    builder.leaf("uses the new API", location!(), [Decorator::semver(">=2.0.0")], |_| {});
    let suite = builder.build()?;

    let mut config = test_config();
    config.semver_filter = version.to_owned();
    let (outcome, _) = run_suite(&suite, &config)?;

    let report = outcome.report.spec_by_text("uses the new API").expect("spec is reported");
    assert_eq!(report.state, Some(expected));
    Ok(())
}

#[test]
fn every_semver_constraint_on_a_spec_must_hold() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("semver");
    builder.leaf(
        "contradicts itself",
        location!(),
        [Decorator::semver(">=2.0.0"), Decorator::semver("<=1.0.0")],
        journal.logger("ran"),
    );
    let suite = builder.build()?;

    let mut config = test_config();
    config.semver_filter = "2.5.0".to_owned();
    let (outcome, _) = run_suite(&suite, &config)?;

    let report = outcome.report.spec_by_text("contradicts itself").expect("spec is reported");
    assert_eq!(report.state, Some(SpecState::Skipped));
    assert_eq!(report.skip_reason, Some(SkipReason::SemVer));
    assert!(journal.entries().is_empty());
    Ok(())
}

#[test]
fn a_descendant_semver_constraint_must_narrow_its_ancestor() {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("semver");
    builder.container("v2 API", location!(), [Decorator::semver(">=2.0.0")], |b| {
        b.leaf("narrower", location!(), [Decorator::semver("^2.1")], journal.logger("ran"));
        b.leaf("wider", location!(), [Decorator::semver(">=1.0.0")], journal.logger("ran"));
    });

    let err = match builder.build() {
        Ok(_) => panic!("a wider descendant constraint is rejected"),
        Err(err) => err,
    };
    let texts: Vec<_> = err.errors.iter().map(|e| e.node_text.as_str()).collect();
    assert_eq!(texts, ["wider"]);
    assert!(matches!(
        &err.errors[0].kind,
        DecoratorMisuseKind::SemVerNotSubset { ancestor_text, .. } if ancestor_text == "v2 API"
    ));
    assert!(journal.entries().is_empty());
}

#[test]
fn label_filter_selects_specs() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("labels");
    builder.container("storage", location!(), [Decorator::labels(["db"])], |b| {
        b.leaf("writes", location!(), [Decorator::labels(["fast"])], journal.logger("writes"));
        b.leaf("compacts", location!(), [Decorator::labels(["slow"])], journal.logger("compacts"));
    });
    builder.leaf("parses", location!(), [Decorator::labels(["fast"])], journal.logger("parses"));
    let suite = builder.build()?;

    let mut config = test_config();
    config.label_filter = "db && !slow".to_owned();
    let (outcome, _) = run_suite(&suite, &config)?;

    assert_eq!(journal.entries(), ["writes"]);
    for text in ["compacts", "parses"] {
        let report = outcome.report.spec_by_text(text).expect("spec is reported");
        assert_eq!(report.skip_reason, Some(SkipReason::LabelFilter), "{text}");
    }
    assert_eq!(
        outcome.report.spec_by_text("writes").map(|r| r.labels.clone()),
        Some(vec!["db".into(), "fast".into()])
    );
    Ok(())
}

#[test]
fn table_entries_become_specs() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("tables");
    builder.table(
        "addition",
        location!(),
        [],
        |ctx, &(a, b, sum): &(i32, i32, i32)| {
            if a + b != sum {
                ctx.fail(format!("{a} + {b} != {sum}"));
            }
        },
        [
            TableEntry::new("small", (1, 2, 3)),
            TableEntry::new("negative", (-1, -2, -3)),
            TableEntry::new("wrong", (2, 2, 5)),
        ],
    );
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    let states: Vec<_> = ["small", "negative", "wrong"]
        .into_iter()
        .map(|text| outcome.report.spec_by_text(text).and_then(|r| r.state))
        .collect();
    assert_eq!(
        states,
        [Some(SpecState::Passed), Some(SpecState::Passed), Some(SpecState::Failed)]
    );
    Ok(())
}

#[test]
fn resolving_twice_gives_equal_lists() -> Result<()> {
    let mut builder = SuiteBuilder::new("resolve");
    builder.container("a", location!(), [Decorator::Ordered], |b| {
        b.leaf("one", location!(), [], |_| {});
        b.leaf("two", location!(), [Decorator::labels(["x"])], |_| {});
    });
    builder.leaf("three", location!(), [Decorator::Serial], |_| {});
    let suite = builder.build()?;

    let first = SpecList::resolve(&suite);
    let second = SpecList::resolve(&suite);
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    Ok(())
}

#[test]
fn preview_reports_without_running() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("preview");
    builder.before_suite(location!(), journal.logger("before suite"));
    builder.leaf("one", location!(), [Decorator::labels(["fast"])], journal.logger("one"));
    builder.leaf("two", location!(), [], journal.logger("two"));
    let suite = builder.build()?;

    let mut config = test_config();
    config.label_filter = "fast".to_owned();
    let report = preview(&suite, &config)?;

    assert!(journal.entries().is_empty(), "nothing runs in a preview");
    assert!(report.preview);
    assert_eq!(report.spec_reports.len(), 2);
    assert!(report.spec_reports.iter().all(|r| r.state.is_none()));
    let two = report.spec_by_text("two").expect("spec is reported");
    assert_eq!(two.skip_reason, Some(SkipReason::LabelFilter));
    Ok(())
}

#[test]
fn abort_suite_skips_everything_after() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("abort");
    builder.container("steps", location!(), [Decorator::Ordered], |b| {
        b.after_each(location!(), [], journal.logger("after"));
        b.leaf("first", location!(), [], journal.logger("first"));
        b.leaf("second", location!(), [], |ctx| ctx.abort_suite("environment is broken"));
        b.leaf("third", location!(), [], journal.logger("third"));
    });
    let suite = builder.build()?;

    let (outcome, events) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed);
    assert_eq!(journal.entries(), ["first", "after", "after"]);
    let report = &outcome.report;
    assert_eq!(
        report.spec_by_text("second").and_then(|r| r.state),
        Some(SpecState::Aborted)
    );
    let third = report.spec_by_text("third").expect("spec is reported");
    assert_eq!(third.state, Some(SpecState::Skipped));
    assert_eq!(third.skip_reason, Some(SkipReason::Aborted));
    assert_eq!(
        report.suite_failure,
        Some(SuiteFailure::Cancelled {
            reason: CancelReason::SuiteAbort
        })
    );
    assert!(events.iter().any(|event| matches!(
        event.kind,
        SuiteEventKind::SuiteCancelled {
            reason: CancelReason::SuiteAbort
        }
    )));
    Ok(())
}

#[test]
fn fail_fast_stops_scheduling_after_the_first_failure() -> Result<()> {
    test_init();

    let ran = Arc::new(AtomicUsize::new(0));
    let mut builder = SuiteBuilder::new("fail fast");
    for index in 0..5 {
        let ran = Arc::clone(&ran);
        builder.leaf(format!("spec {index}"), location!(), [], move |ctx| {
            ran.fetch_add(1, Ordering::SeqCst);
            if index == 2 {
                ctx.fail("broken");
            }
        });
    }
    let suite = builder.build()?;

    let mut config = test_config();
    config.fail_fast = true;
    let (outcome, _) = run_suite(&suite, &config)?;

    let report = &outcome.report;
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.ran, ran.load(Ordering::SeqCst));
    assert_eq!(report.stats.ran + report.stats.skipped, 5);
    for spec in &report.spec_reports {
        if spec.state == Some(SpecState::Skipped) {
            assert_eq!(spec.skip_reason, Some(SkipReason::Aborted));
        }
    }
    assert_eq!(
        report.suite_failure,
        Some(SuiteFailure::Cancelled {
            reason: CancelReason::FailFast
        })
    );
    Ok(())
}

#[test]
fn before_suite_failure_skips_every_spec() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("setup");
    builder.before_suite(location!(), |ctx| ctx.fail("could not start the server"));
    builder.after_suite(location!(), journal.logger("after suite"));
    builder.leaf("one", location!(), [], journal.logger("one"));
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed);
    assert_eq!(journal.entries(), ["after suite"]);
    let report = &outcome.report;
    assert_eq!(report.suite_failure, Some(SuiteFailure::BeforeSuiteFailed));
    let one = report.spec_by_text("one").expect("spec is reported");
    assert_eq!(one.skip_reason, Some(SkipReason::SuiteSetupFailed));
    let node_types: Vec<_> = report.suite_node_reports.iter().map(|n| n.node_type).collect();
    assert_eq!(node_types, [NodeType::BeforeSuite, NodeType::AfterSuite]);
    Ok(())
}
