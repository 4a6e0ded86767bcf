// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use test_case::test_case;
use trellis_runner::{
    location,
    reporter::{SkipReason, SpecState},
    tree::{Decorator, NodeType, SuiteBuilder},
};

#[test_case(1; "seed 1")]
#[test_case(2; "seed 2")]
#[test_case(42; "seed 42")]
#[test_case(9001; "seed 9001")]
fn ordered_containers_keep_declaration_order(seed: u64) -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("ordering");
    builder.container("workflow", location!(), [Decorator::Ordered], |b| {
        for step in ["create", "update", "publish", "delete"] {
            b.leaf(step, location!(), [], journal.logger(step));
        }
    });
    for index in 0..6 {
        builder.leaf(format!("unrelated {index}"), location!(), [], |_| {});
    }
    let suite = builder.build()?;

    let mut config = test_config();
    config.seed = Some(seed);
    config.randomize_all_specs = true;
    let (outcome, _) = run_suite(&suite, &config)?;

    assert!(outcome.passed);
    assert_eq!(outcome.report.seed, seed);
    assert_eq!(journal.entries(), ["create", "update", "publish", "delete"]);
    Ok(())
}

#[test]
fn before_all_and_after_all_bracket_the_group() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("bracketed");
    builder.container("session", location!(), [Decorator::Ordered], |b| {
        b.before_all(location!(), [], journal.logger("open"));
        b.before_each(location!(), [], journal.logger("reset"));
        b.after_all(location!(), [], journal.logger("close"));
        b.leaf("one", location!(), [], journal.logger("one"));
        b.leaf("two", location!(), [], journal.logger("two"));
        b.leaf("three", location!(), [], journal.logger("three"));
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed);
    assert_eq!(
        journal.entries(),
        ["open", "reset", "one", "reset", "two", "reset", "three", "close"]
    );
    Ok(())
}

#[test]
fn once_per_ordered_hooks_run_once_per_group() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("once per ordered");
    builder.container("outer", location!(), [], |b| {
        b.before_each(location!(), [Decorator::OncePerOrdered], journal.logger("setup"));
        b.after_each(location!(), [Decorator::OncePerOrdered], journal.logger("teardown"));
        b.container("steps", location!(), [Decorator::Ordered], |b| {
            b.leaf("a", location!(), [], journal.logger("a"));
            b.leaf("b", location!(), [], journal.logger("b"));
        });
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed);
    assert_eq!(journal.entries(), ["setup", "a", "b", "teardown"]);
    Ok(())
}

#[test]
fn ordered_failure_skips_the_rest_of_the_group() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("ordered failure");
    builder.container("migration", location!(), [Decorator::Ordered], |b| {
        b.after_all(location!(), [], journal.logger("rollback"));
        b.leaf("backs up", location!(), [], journal.logger("backs up"));
        b.leaf("migrates", location!(), [], |ctx| ctx.fail("column already exists"));
        b.leaf("verifies", location!(), [], journal.logger("verifies"));
        b.leaf("cleans up", location!(), [], journal.logger("cleans up"));
    });
    builder.leaf("independent", location!(), [], journal.logger("independent"));
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed);
    let entries = journal.entries();
    assert!(entries.contains(&"independent".to_owned()), "other units still run");
    let group: Vec<_> = entries.iter().filter(|e| *e != "independent").collect();
    assert_eq!(group, ["backs up", "rollback"]);

    for text in ["verifies", "cleans up"] {
        let report = outcome.report.spec_by_text(text).expect("spec is reported");
        assert_eq!(report.state, Some(SpecState::Skipped), "{text}");
        assert_eq!(report.skip_reason, Some(SkipReason::EarlierOrderedFailure), "{text}");
    }
    Ok(())
}

#[test]
fn cleanup_from_before_all_runs_after_after_all() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("cleanups");
    builder.container("server", location!(), [Decorator::Ordered], |b| {
        let logger = journal.clone();
        b.before_all(location!(), [], move |ctx| {
            logger.log("start");
            let logger = logger.clone();
            ctx.defer_cleanup(move |_| logger.log("stop"));
        });
        b.after_all(location!(), [], journal.logger("drain"));
        b.leaf("serves", location!(), [], journal.logger("serves"));
        b.leaf("reloads", location!(), [], journal.logger("reloads"));
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(outcome.passed);
    assert_eq!(journal.entries(), ["start", "serves", "reloads", "drain", "stop"]);
    Ok(())
}

#[test]
fn after_all_failure_is_reported_on_the_last_spec() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("teardown failure");
    builder.container("pool", location!(), [Decorator::Ordered], |b| {
        b.after_all(location!(), [], |ctx| ctx.fail("connections leaked"));
        b.leaf("borrows", location!(), [], |_| {});
        b.leaf("returns", location!(), [], |_| {});
    });
    let suite = builder.build()?;

    let (outcome, _) = run_suite(&suite, &test_config())?;

    assert!(!outcome.passed);
    let first = outcome.report.spec_by_text("borrows").expect("spec is reported");
    assert_eq!(first.state, Some(SpecState::Passed));
    let last = outcome.report.spec_by_text("returns").expect("spec is reported");
    assert_eq!(last.state, Some(SpecState::Failed));
    let failure = last.failure.as_ref().expect("failure is recorded");
    assert_eq!(failure.node_type, NodeType::AfterAll);
    assert_eq!(failure.message, "connections leaked");
    Ok(())
}
