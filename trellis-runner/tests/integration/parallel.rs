// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};
use tokio::net::TcpListener;
use trellis_runner::{
    config::{ParallelConfig, SuiteConfig},
    location,
    parallel::{ParallelServer, ParallelSession, serve},
    reporter::{SpecState, SuiteFailure},
    runner::{SuiteOutcome, SuiteRunnerBuilder},
    tree::{Decorator, Suite, SuiteBuilder},
};

fn server(total: usize) -> Arc<ParallelServer> {
    Arc::new(ParallelServer::new(
        NonZeroUsize::new(total).expect("total is non-zero"),
    ))
}

fn run_process(suite: &Suite, session: ParallelSession) -> Result<SuiteOutcome> {
    run_process_with(suite, session, &test_config())
}

fn run_process_with(
    suite: &Suite,
    session: ParallelSession,
    config: &SuiteConfig,
) -> Result<SuiteOutcome> {
    let mut builder = SuiteRunnerBuilder::default();
    builder.set_parallel_session(session);
    let (outcome, _) = run_suite_with(builder, suite, config)?;
    Ok(outcome)
}

/// Runs every process of a run as a thread and returns the outcomes, primary first.
fn run_local(suite: &Suite, total: usize) -> Result<Vec<SuiteOutcome>> {
    run_local_with(suite, total, &test_config())
}

fn run_local_with(
    suite: &Suite,
    total: usize,
    config: &SuiteConfig,
) -> Result<Vec<SuiteOutcome>> {
    let server = server(total);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (1..=total)
            .map(|process| {
                let server = &server;
                s.spawn(move || -> Result<SuiteOutcome> {
                    run_process_with(suite, ParallelSession::local(server, process)?, config)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("process thread panicked"))
            .collect()
    });
    results.into_iter().collect()
}

fn all_passed(outcome: &SuiteOutcome) -> bool {
    outcome
        .report
        .spec_reports
        .iter()
        .all(|report| report.state == Some(SpecState::Passed))
}

#[test]
fn synchronized_before_suite_shares_the_primary_payload() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("shared setup");
    let primary_log = journal.clone();
    let all_log = journal.clone();
    builder.synchronized_before_suite(
        location!(),
        move |ctx| {
            primary_log.log(format!("primary ran on {}", ctx.parallel_process()));
            b"db=127.0.0.1:5432".to_vec()
        },
        move |ctx, payload| {
            all_log.log(format!(
                "{} got {}",
                ctx.parallel_process(),
                String::from_utf8_lossy(payload)
            ));
        },
    );
    for index in 0..8 {
        builder.leaf(format!("spec {index}"), location!(), [], |_| {});
    }
    let suite = builder.build()?;

    let outcomes = run_local(&suite, 2)?;

    assert_eq!(journal.count("primary ran on 1"), 1);
    assert_eq!(journal.count("1 got db=127.0.0.1:5432"), 1);
    assert_eq!(journal.count("2 got db=127.0.0.1:5432"), 1);

    let primary = &outcomes[0];
    assert!(primary.passed, "primary passed");
    assert_eq!(primary.report.process_count, 2);
    assert_eq!(primary.report.spec_reports.len(), 8, "the primary merges every report");
    assert!(all_passed(primary));
    assert!(outcomes[1].passed, "secondary passed");
    Ok(())
}

#[test]
fn the_primary_phase_finishes_before_any_process_starts_the_second() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("phases");
    let primary_log = journal.clone();
    let all_log = journal.clone();
    builder.synchronized_before_suite(
        location!(),
        move |_| {
            primary_log.log("phase one started");
            // Gives a secondary that isn't held back time to start its second phase.
            thread::sleep(Duration::from_millis(100));
            primary_log.log("phase one finished");
            Vec::new()
        },
        move |ctx, _| all_log.log(format!("phase two on {}", ctx.parallel_process())),
    );
    builder.leaf("spec", location!(), [], |_| {});
    let suite = builder.build()?;

    let outcomes = run_local(&suite, 3)?;

    let entries = journal.entries();
    assert_eq!(entries.len(), 5, "entries: {entries:?}");
    assert_eq!(entries[0], "phase one started");
    assert_eq!(entries[1], "phase one finished");
    let second: BTreeSet<_> = entries[2..].iter().map(String::as_str).collect();
    assert_eq!(
        second,
        BTreeSet::from(["phase two on 1", "phase two on 2", "phase two on 3"])
    );
    assert!(outcomes.iter().all(|outcome| outcome.passed));
    Ok(())
}

#[test]
fn every_spec_runs_exactly_once() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("claims");
    for index in 0..20 {
        let journal = journal.clone();
        builder.leaf(format!("spec {index}"), location!(), [], move |_| {
            journal.log(format!("spec {index}"))
        });
    }
    let suite = builder.build()?;

    let outcomes = run_local(&suite, 3)?;

    let mut entries = journal.entries();
    entries.sort();
    entries.dedup();
    assert_eq!(entries.len(), 20);
    assert_eq!(journal.entries().len(), 20, "no spec runs twice");
    let primary = &outcomes[0];
    assert_eq!(primary.report.stats.passed, 20);
    assert!(
        primary
            .report
            .spec_reports
            .iter()
            .all(|report| (1..=3).contains(&report.process))
    );
    Ok(())
}

#[test]
fn serial_specs_run_on_the_primary_after_the_rest() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("serial");
    for index in 0..6 {
        builder.leaf(format!("parallel {index}"), location!(), [], journal.logger("parallel"));
    }
    builder.container("exclusive", location!(), [Decorator::Serial], |b| {
        b.leaf("migrates", location!(), [], journal.logger("serial"));
        b.leaf("reindexes", location!(), [], journal.logger("serial"));
    });
    let suite = builder.build()?;

    let outcomes = run_local(&suite, 3)?;

    let entries = journal.entries();
    let first_serial = entries.iter().position(|e| e == "serial").expect("serial specs ran");
    assert!(
        entries[first_serial..].iter().all(|e| e == "serial"),
        "serial specs run after every parallel spec: {entries:?}"
    );
    let primary = &outcomes[0];
    assert!(all_passed(primary));
    for text in ["migrates", "reindexes"] {
        let report = primary.report.spec_by_text(text).expect("spec is reported");
        assert_eq!(report.process, 1, "{text}");
    }
    Ok(())
}

#[test]
fn ordered_groups_stay_on_one_process() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("ordered");
    builder.container("checkout", location!(), [Decorator::Ordered], |b| {
        for step in ["add to cart", "pay", "ship", "confirm"] {
            b.leaf(step, location!(), [], journal.logger(step));
        }
    });
    for index in 0..6 {
        builder.leaf(format!("unrelated {index}"), location!(), [], |_| {});
    }
    let suite = builder.build()?;

    let outcomes = run_local(&suite, 3)?;

    assert_eq!(journal.entries(), ["add to cart", "pay", "ship", "confirm"]);
    let primary = &outcomes[0];
    let processes: BTreeSet<_> = ["add to cart", "pay", "ship", "confirm"]
        .into_iter()
        .filter_map(|text| primary.report.spec_by_text(text))
        .map(|report| report.process)
        .collect();
    assert_eq!(processes.len(), 1, "one process ran the whole group");
    Ok(())
}

#[test]
fn a_vanished_primary_fails_the_secondary() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("orphaned");
    builder.synchronized_before_suite(
        location!(),
        |_| b"payload".to_vec(),
        |_, _| {},
    );
    builder.leaf("never runs", location!(), [], journal.logger("ran"));
    let suite = builder.build()?;

    let server = server(2);
    // Dropping the primary's session before it registers marks it as gone.
    drop(ParallelSession::local(&server, 1)?);
    let outcome = run_process(&suite, ParallelSession::local(&server, 2)?)?;

    assert!(!outcome.passed);
    assert!(journal.entries().is_empty());
    assert!(
        matches!(
            outcome.report.suite_failure,
            Some(SuiteFailure::ParallelProcessFailure { .. })
        ),
        "unexpected suite failure: {:?}",
        outcome.report.suite_failure
    );
    Ok(())
}

#[test]
fn a_primary_lost_during_the_first_phase_fails_the_secondary() -> Result<()> {
    test_init();

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("lost primary");
    builder.synchronized_before_suite(
        location!(),
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            move |_| {
                entered.wait();
                release.wait();
                b"too late".to_vec()
            }
        },
        {
            let journal = journal.clone();
            move |ctx, _| journal.log(format!("phase two on {}", ctx.parallel_process()))
        },
    );
    builder.leaf("spec", location!(), [], |_| {});
    let suite = builder.build()?;

    let server = server(2);
    thread::scope(|s| -> Result<()> {
        let primary = s.spawn(|| -> Result<SuiteOutcome> {
            run_process(&suite, ParallelSession::local(&server, 1)?)
        });
        entered.wait();
        let secondary = s.spawn(|| -> Result<SuiteOutcome> {
            run_process(&suite, ParallelSession::local(&server, 2)?)
        });
        // The primary is registered and inside its first phase. Losing its connection now is
        // what the TCP server reports when the process dies.
        thread::sleep(Duration::from_millis(50));
        server.mark_gone(1);

        let outcome = secondary.join().expect("secondary thread panicked")?;
        assert!(!outcome.passed);
        assert_eq!(journal.count("phase two on 2"), 0);
        assert!(
            matches!(
                outcome.report.suite_failure,
                Some(SuiteFailure::ParallelProcessFailure { .. })
            ),
            "unexpected suite failure: {:?}",
            outcome.report.suite_failure
        );

        release.wait();
        primary.join().expect("primary thread panicked")?;
        Ok(())
    })
}

#[test]
fn processes_agree_on_an_unset_seed() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("unseeded");
    for group in 0..4 {
        builder.container(format!("group {group}"), location!(), [], |b| {
            for index in 0..5 {
                let journal = journal.clone();
                b.leaf(format!("spec {index}"), location!(), [], move |_| {
                    journal.log(format!("group {group} spec {index}"))
                });
            }
        });
    }
    let suite = builder.build()?;

    let mut config = test_config();
    config.seed = None;
    config.randomize_all_specs = true;
    let outcomes = run_local_with(&suite, 2, &config)?;

    assert!(outcomes.iter().all(|outcome| outcome.report.seed == 0));
    let mut entries = journal.entries();
    assert_eq!(entries.len(), 20, "no spec runs twice");
    entries.sort();
    entries.dedup();
    assert_eq!(entries.len(), 20, "every spec runs");
    assert_eq!(outcomes[0].report.stats.passed, 20);
    Ok(())
}

#[test]
fn processes_coordinate_over_tcp() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("tcp");
    builder.before_suite(location!(), |_| {});
    for index in 0..10 {
        builder.leaf(format!("spec {index}"), location!(), [], |_| {});
    }
    let suite = builder.build()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0"))?;
    let address = listener.local_addr()?.to_string();
    runtime.spawn(serve(listener, server(2)));

    let results: Vec<Result<SuiteOutcome>> = thread::scope(|s| {
        let handles: Vec<_> = [1, 2]
            .into_iter()
            .map(|process| {
                let suite = &suite;
                let address = address.clone();
                s.spawn(move || -> Result<SuiteOutcome> {
                    let mut config = ParallelConfig::new(process, 2)?;
                    config.address = Some(address);
                    let session = ParallelSession::connect(&config).expect("address is set");
                    run_process(suite, session)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("process thread panicked"))
            .collect()
    });
    let outcomes: Vec<_> = results.into_iter().collect::<Result<_>>()?;

    let primary = &outcomes[0];
    assert!(primary.passed, "primary passed");
    assert_eq!(primary.report.stats.passed, 10);
    assert!(outcomes[1].passed, "secondary passed");
    Ok(())
}
