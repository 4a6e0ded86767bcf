// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use camino_tempfile::Utf8TempDir;
use color_eyre::eyre::{Result, bail};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{fs, num::NonZeroU32, time::Duration};
use test_case::test_case;
use trellis_runner::{
    config::{ParallelConfig, SuiteConfig},
    errors::{ConfigParseErrorKind, SuiteRunnerBuildError},
    location,
    output::CaptureStrategy,
    reporter::SkipReason,
    runner::SuiteRunnerBuilder,
    signal::SignalHandlerKind,
    tree::SuiteBuilder,
};

fn write_config(dir: &Utf8TempDir, contents: &str) -> Result<camino::Utf8PathBuf> {
    let path = dir.path().join("trellis.toml");
    fs::write(&path, contents)?;
    Ok(path)
}

#[test]
fn config_file_is_layered_over_the_defaults() -> Result<()> {
    test_init();

    let dir = camino_tempfile::tempdir()?;
    let path = write_config(
        &dir,
        indoc! {r#"
            seed = 42
            fail-fast = true
            flake-attempts = 3
            label-filter = "fast && !flaky"
            focus = ["checkout"]
            poll-progress-after = "5s"
            timeout = "10m"
            capture = "writer-only"
        "#},
    )?;

    let config = SuiteConfig::from_sources(Some(path.as_path()))?;

    assert_eq!(config.seed, Some(42));
    assert!(config.fail_fast);
    assert_eq!(config.flake_attempts, NonZeroU32::new(3));
    assert_eq!(config.label_filter, "fast && !flaky");
    assert_eq!(config.focus, ["checkout"]);
    assert_eq!(config.poll_progress_after, Some(Duration::from_secs(5)));
    assert_eq!(config.timeout, Some(Duration::from_secs(600)));
    assert_eq!(config.capture, CaptureStrategy::WriterOnly);
    // Untouched settings keep their defaults.
    assert_eq!(config.grace_period, Duration::from_secs(30));
    assert!(!config.randomize_all_specs);
    assert_eq!(config.resolved_seed(), 42);
    Ok(())
}

#[test_case(
    indoc! {r#"
        flake-attempts = 2
        must-pass-repeatedly = 2
    "#};
    "conflicting retry overrides"
)]
#[test_case(
    indoc! {r#"
        [parallel]
        total = 2
        process = 3
    "#};
    "process out of range"
)]
#[test_case(
    indoc! {r#"
        unknown-setting = true
    "#};
    "unknown key"
)]
#[test_case(
    indoc! {r#"
        timeout = "soon"
    "#};
    "invalid duration"
)]
fn invalid_config_files_are_rejected(contents: &str) -> Result<()> {
    test_init();

    let dir = camino_tempfile::tempdir()?;
    let path = write_config(&dir, contents)?;

    match SuiteConfig::from_sources(Some(path.as_path())) {
        Ok(config) => bail!("config was accepted: {config:?}"),
        Err(err) => assert_eq!(err.config_file(), Some(&path)),
    }
    Ok(())
}

#[test]
fn conflicting_overrides_have_their_own_error() {
    let mut config = SuiteConfig::default();
    config.flake_attempts = NonZeroU32::new(2);
    config.must_pass_repeatedly = NonZeroU32::new(2);
    assert!(matches!(
        config.validate(),
        Err(ConfigParseErrorKind::ConflictingRetryOverrides)
    ));
}

#[test_case(0, 2; "process zero")]
#[test_case(3, 2; "process past total")]
fn parallel_process_must_be_in_range(process: usize, total: usize) {
    assert!(matches!(
        ParallelConfig::new(process, total),
        Err(ConfigParseErrorKind::ParallelProcessOutOfRange { .. })
    ));
}

#[test]
fn parallel_config_without_a_session_fails_the_build() -> Result<()> {
    test_init();

    let mut builder = SuiteBuilder::new("parallel");
    builder.leaf("runs", location!(), [], |_| {});
    let suite = builder.build()?;

    let mut config = test_config();
    config.parallel = ParallelConfig::new(1, 2)?;
    let result = SuiteRunnerBuilder::default().build(&suite, &config, SignalHandlerKind::Noop);

    match result {
        Err(SuiteRunnerBuildError::MissingParallelClient { total }) => assert_eq!(total, 2),
        Err(other) => bail!("unexpected error: {other}"),
        Ok(_) => bail!("a parallel run needs a session"),
    }
    Ok(())
}

#[test]
fn text_and_location_filters_from_config() -> Result<()> {
    test_init();

    let journal = Journal::default();
    let mut builder = SuiteBuilder::new("filters");
    builder.container("billing", location!(), [], |b| {
        b.leaf("charges", location!(), [], journal.logger("charges"));
        b.leaf("refunds", location!(), [], journal.logger("refunds"));
    });
    builder.leaf("sends email", location!(), [], journal.logger("email"));
    let suite = builder.build()?;

    let mut config = test_config();
    config.focus = vec!["^billing".to_owned()];
    config.skip = vec!["refunds$".to_owned()];
    let (outcome, _) = run_suite(&suite, &config)?;

    assert_eq!(journal.entries(), ["charges"]);
    for text in ["refunds", "sends email"] {
        let report = outcome.report.spec_by_text(text).expect("spec is reported");
        assert_eq!(report.skip_reason, Some(SkipReason::TextFilter), "{text}");
    }
    assert_eq!(outcome.report.filters.focus, ["^billing"]);

    let mut config = test_config();
    config.skip_file = vec!["config\\.rs".to_owned()];
    let (outcome, _) = run_suite(&suite, &config)?;
    assert!(
        outcome
            .report
            .spec_reports
            .iter()
            .all(|report| report.skip_reason == Some(SkipReason::LocationFilter))
    );
    Ok(())
}
