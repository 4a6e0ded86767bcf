// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ParallelConfig, PollProgress, RetryPolicy};
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind},
    output::CaptureStrategy,
};
use camino::Utf8Path;
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::{
    num::NonZeroU32,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::debug;

/// Configuration for one run of a suite.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
#[non_exhaustive]
pub struct SuiteConfig {
    /// The seed used to shuffle specs. If unset, a seed is derived from the current time.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Shuffle the children of every container rather than just the top level.
    #[serde(default)]
    pub randomize_all_specs: bool,

    /// A label filter expression.
    #[serde(default)]
    pub label_filter: String,

    /// The version matched against semantic version constraints.
    #[serde(default)]
    pub semver_filter: String,

    /// Regular expressions a spec's full text must match one of.
    #[serde(default)]
    pub focus: Vec<String>,

    /// Regular expressions that exclude a spec if its full text matches any.
    #[serde(default)]
    pub skip: Vec<String>,

    /// Location selectors a spec must match one of.
    #[serde(default)]
    pub focus_file: Vec<String>,

    /// Location selectors that exclude a spec if any match.
    #[serde(default)]
    pub skip_file: Vec<String>,

    /// Overrides every spec's retry policy with FlakeAttempts.
    #[serde(default)]
    pub flake_attempts: Option<NonZeroU32>,

    /// Overrides every spec's retry policy with MustPassRepeatedly.
    #[serde(default)]
    pub must_pass_repeatedly: Option<NonZeroU32>,

    /// Default delay before the first automatic progress report.
    #[serde(default, with = "humantime_serde")]
    pub poll_progress_after: Option<Duration>,

    /// Default interval between automatic progress reports.
    #[serde(default, with = "humantime_serde")]
    pub poll_progress_interval: Option<Duration>,

    /// Deadline for the whole suite.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Deadline for each spec attempt, unless the spec declares its own.
    #[serde(default, with = "humantime_serde")]
    pub default_spec_timeout: Option<Duration>,

    /// How long teardown may run after a timeout or interrupt.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Stop scheduling specs after the first failure.
    #[serde(default)]
    pub fail_fast: bool,

    /// How spec output is captured.
    #[serde(default)]
    pub capture: CaptureStrategy,

    /// This process's place in a parallel run.
    #[serde(default)]
    pub parallel: ParallelConfig,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            seed: None,
            randomize_all_specs: false,
            label_filter: String::new(),
            semver_filter: String::new(),
            focus: Vec::new(),
            skip: Vec::new(),
            focus_file: Vec::new(),
            skip_file: Vec::new(),
            flake_attempts: None,
            must_pass_repeatedly: None,
            poll_progress_after: None,
            poll_progress_interval: None,
            timeout: None,
            default_spec_timeout: None,
            grace_period: default_grace_period(),
            fail_fast: false,
            capture: CaptureStrategy::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

impl SuiteConfig {
    /// The default configuration.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Loads configuration from the defaults, an optional config file and the environment.
    ///
    /// A config file that is passed in must exist.
    pub fn from_sources(config_file: Option<&Utf8Path>) -> Result<Self, ConfigParseError> {
        Self::from_sources_impl(config_file, |name| std::env::var(name).ok())
    }

    pub(crate) fn from_sources_impl(
        config_file: Option<&Utf8Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigParseError> {
        let error = |kind| ConfigParseError::new(config_file.map(ToOwned::to_owned), kind);

        let mut builder = Config::builder()
            .add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml));
        if let Some(config_file) = config_file {
            builder = builder.add_source(File::new(config_file.as_str(), FileFormat::Toml));
        }
        let mut config: SuiteConfig = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| error(ConfigParseErrorKind::Build(Box::new(err))))?;

        if let Some(parallel) = ParallelConfig::from_env_lookup(env).map_err(error)? {
            debug!(
                process = parallel.process.get(),
                total = parallel.total.get(),
                "parallel config read from environment"
            );
            config.parallel = parallel;
        }
        config.validate().map_err(error)?;
        Ok(config)
    }

    /// Checks settings that can't be expressed in the type.
    pub fn validate(&self) -> Result<(), ConfigParseErrorKind> {
        if self.flake_attempts.is_some() && self.must_pass_repeatedly.is_some() {
            return Err(ConfigParseErrorKind::ConflictingRetryOverrides);
        }
        self.parallel.validate()
    }

    /// Returns the retry policy that overrides every spec's own, if one is configured.
    pub fn retry_override(&self) -> Option<RetryPolicy> {
        RetryPolicy::from_decorators(
            self.flake_attempts.map(NonZeroU32::get),
            self.must_pass_repeatedly.map(NonZeroU32::get),
        )
    }

    /// Returns the suite-wide progress polling defaults.
    pub fn poll_progress_defaults(&self) -> PollProgress {
        PollProgress {
            after: self.poll_progress_after,
            interval: self.poll_progress_interval,
        }
    }

    /// Returns the seed to shuffle with.
    ///
    /// Every process of a parallel run must shuffle identically, so an unset seed resolves to 0
    /// when more than one process is configured.
    pub fn resolved_seed(&self) -> u64 {
        self.resolved_seed_for(&self.parallel)
    }

    /// Returns the seed for a run coordinated with `parallel`, which takes precedence over
    /// [`parallel`](Self::parallel) when the process belongs to a session.
    pub fn resolved_seed_for(&self, parallel: &ParallelConfig) -> u64 {
        match self.seed {
            Some(seed) => seed,
            None if parallel.is_parallel() => 0,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}
