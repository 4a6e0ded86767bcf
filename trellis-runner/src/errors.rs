// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by trellis.

use crate::tree::CodeLocation;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::{fmt, io};
use thiserror::Error;
use trellis_filtering::errors::{LabelFilterParseError, LabelValidationError, SemVerError};

/// A single problem found while building a suite.
#[derive(Debug, Error)]
#[error("{location}: `{node_text}`: {kind}")]
#[non_exhaustive]
pub struct DecoratorMisuse {
    /// The text of the node the problem was found on.
    pub node_text: String,

    /// Where the node was declared.
    pub location: CodeLocation,

    /// The kind of problem.
    pub kind: DecoratorMisuseKind,
}

impl DecoratorMisuse {
    pub(crate) fn new(
        node_text: impl Into<String>,
        location: CodeLocation,
        kind: DecoratorMisuseKind,
    ) -> Self {
        Self {
            node_text: node_text.into(),
            location,
            kind,
        }
    }
}

/// The kind of a [`DecoratorMisuse`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecoratorMisuseKind {
    #[error("Focus and Pending cannot both be set on the same node")]
    FocusAndPending,

    #[error("FlakeAttempts and MustPassRepeatedly cannot both be set on the same node")]
    FlakeAndRepeat,

    #[error("{decorator} requires a positive argument")]
    NonPositiveArgument { decorator: &'static str },

    #[error("invalid label")]
    InvalidLabel(#[source] LabelValidationError),

    #[error("invalid semantic version constraint")]
    InvalidSemVer(#[source] SemVerError),

    #[error(
        "semantic version constraint `{constraint}` is not a subset of `{ancestor}` declared on \
         `{ancestor_text}`"
    )]
    SemVerNotSubset {
        constraint: String,
        ancestor: String,
        ancestor_text: String,
    },

    #[error("{hook} can only be used inside an Ordered container")]
    HookOutsideOrdered { hook: &'static str },

    #[error("Ordered can only be applied to containers")]
    OrderedOnLeaf,

    #[error("OncePerOrdered can only be applied to setup and teardown hooks")]
    OncePerOrderedOnNonHook,

    #[error("{decorator} cannot be applied to hooks")]
    DecoratorOnHook { decorator: &'static str },

    #[error("container body panicked: {message}")]
    ContainerPanicked { message: String },

    #[error("{hook} was already registered at {previous}")]
    DuplicateSuiteHook {
        hook: &'static str,
        previous: CodeLocation,
    },

    #[error("{hook} must be registered at the top level, not inside a container")]
    SuiteHookInContainer { hook: &'static str },
}

/// An error that occurred while building a suite. Every problem found is collected, and no spec
/// runs.
#[derive(Debug)]
#[non_exhaustive]
pub struct SuiteBuildError {
    /// The name of the suite.
    pub suite_name: String,

    /// The problems found, in declaration order.
    pub errors: Vec<DecoratorMisuse>,
}

impl SuiteBuildError {
    pub(crate) fn new(suite_name: impl Into<String>, errors: Vec<DecoratorMisuse>) -> Self {
        Self {
            suite_name: suite_name.into(),
            errors,
        }
    }
}

impl fmt::Display for SuiteBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.errors.len();
        writeln!(
            f,
            "suite `{}` failed to build with {count} {}:",
            self.suite_name,
            if count == 1 { "error" } else { "errors" },
        )?;
        for error in &self.errors {
            writeln!(f, "  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SuiteBuildError {}

/// An error that occurred while loading a [`SuiteConfig`](crate::config::SuiteConfig).
#[derive(Debug, Error)]
#[error(
    "failed to parse trellis config{}",
    .config_file.as_ref().map(|file| format!(" at `{file}`")).unwrap_or_default()
)]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self { config_file, kind }
    }

    /// Returns the config file that failed to parse, if any.
    pub fn config_file(&self) -> Option<&Utf8PathBuf> {
        self.config_file.as_ref()
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of a [`ConfigParseError`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// The config sources could not be read or deserialized.
    #[error(transparent)]
    Build(Box<ConfigError>),

    /// Both retry overrides were set.
    #[error("`flake-attempts` and `must-pass-repeatedly` cannot both be set")]
    ConflictingRetryOverrides,

    /// The parallel process index is out of range.
    #[error("parallel process {process} is out of range for {total} total processes")]
    ParallelProcessOutOfRange { process: usize, total: usize },

    /// A launcher environment variable could not be parsed.
    #[error("environment variable `{name}` has invalid value `{value}`")]
    InvalidEnvVar { name: &'static str, value: String },
}

/// An error that occurred while parsing a location selector like `specs/login.rs:10-20`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LocationSelectorParseError {
    #[error("invalid file pattern in location selector `{input}`")]
    InvalidFilePattern {
        input: String,
        #[source]
        err: regex::Error,
    },

    #[error("invalid line range `{lines}` in location selector `{input}`")]
    InvalidLineRange { input: String, lines: String },
}

/// An error that occurred while compiling the spec filter from configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FilterBuildError {
    #[error("invalid label filter")]
    LabelFilter(#[from] LabelFilterParseError),

    #[error("invalid semver filter")]
    SemVer(#[from] SemVerError),

    #[error("invalid {kind} pattern `{pattern}`")]
    TextPattern {
        kind: &'static str,
        pattern: String,
        #[source]
        err: regex::Error,
    },

    #[error("invalid location selector")]
    LocationSelector(#[from] LocationSelectorParseError),
}

/// An error that occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] io::Error);

/// An error that occurred while building a [`SuiteRunner`](crate::runner::SuiteRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] io::Error),

    /// An error occurred while setting up signals.
    #[error("error setting up signals")]
    SignalHandlerSetupError(#[from] SignalHandlerSetupError),

    /// The spec filter could not be compiled.
    #[error("error compiling spec filter")]
    Filter(#[from] FilterBuildError),

    /// The configuration is inconsistent.
    #[error("invalid configuration")]
    Config(#[from] ConfigParseError),

    /// More than one process was configured but no rendezvous client was supplied.
    #[error("parallel run with {total} processes requires a rendezvous client")]
    MissingParallelClient { total: usize },
}

/// An error in cross-process coordination.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParallelError {
    /// A cooperating process terminated abnormally.
    #[error("parallel process {process} terminated abnormally: {message}")]
    ProcessFailure { process: usize, message: String },

    /// The primary process's synchronized before-suite phase failed.
    #[error("synchronized before-suite failed on the primary process")]
    BeforeSuiteFailed,

    /// An I/O error on the rendezvous transport.
    #[error("rendezvous transport error")]
    Transport(#[from] io::Error),

    /// A message on the rendezvous transport could not be encoded or decoded.
    #[error("rendezvous protocol error")]
    Protocol(#[from] serde_json::Error),

    /// The rendezvous server rejected a request.
    #[error("rendezvous server error: {0}")]
    Server(String),
}
