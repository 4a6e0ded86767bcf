// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::ConfigParseErrorKind;
use serde::Deserialize;
use std::num::NonZeroUsize;

/// Which process of a parallel run this is.
///
/// Process 1 is the primary: it hosts the synchronized before-suite and after-suite phases, runs
/// serial specs and merges reports.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParallelConfig {
    /// The total number of cooperating processes.
    #[serde(default = "one")]
    pub total: NonZeroUsize,

    /// This process's 1-based index.
    #[serde(default = "one")]
    pub process: NonZeroUsize,

    /// The address of the rendezvous server, for processes that connect over TCP.
    #[serde(default)]
    pub address: Option<String>,
}

fn one() -> NonZeroUsize {
    NonZeroUsize::MIN
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            total: one(),
            process: one(),
            address: None,
        }
    }
}

impl ParallelConfig {
    /// The environment variable a launcher sets to the total number of processes.
    pub const TOTAL_ENV: &'static str = "TRELLIS_PARALLEL_TOTAL";

    /// The environment variable a launcher sets to this process's index.
    pub const PROCESS_ENV: &'static str = "TRELLIS_PARALLEL_PROCESS";

    /// The environment variable a launcher sets to the rendezvous server address.
    pub const ADDRESS_ENV: &'static str = "TRELLIS_PARALLEL_ADDRESS";

    /// Creates a config for process `process` of `total`.
    pub fn new(process: usize, total: usize) -> Result<Self, ConfigParseErrorKind> {
        let out_of_range = || ConfigParseErrorKind::ParallelProcessOutOfRange { process, total };
        let config = Self {
            total: NonZeroUsize::new(total).ok_or_else(out_of_range)?,
            process: NonZeroUsize::new(process).ok_or_else(out_of_range)?,
            address: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns true if this is process 1.
    pub fn is_primary(&self) -> bool {
        self.process == NonZeroUsize::MIN
    }

    /// Returns true if more than one process is cooperating.
    pub fn is_parallel(&self) -> bool {
        self.total > NonZeroUsize::MIN
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigParseErrorKind> {
        if self.process > self.total {
            return Err(ConfigParseErrorKind::ParallelProcessOutOfRange {
                process: self.process.get(),
                total: self.total.get(),
            });
        }
        Ok(())
    }

    /// Reads the launcher's environment variables. Returns `None` if the launcher didn't set the
    /// total.
    pub fn from_env() -> Result<Option<Self>, ConfigParseErrorKind> {
        Self::from_env_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_env_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigParseErrorKind> {
        let Some(total) = lookup(Self::TOTAL_ENV) else {
            return Ok(None);
        };
        let parse = |name: &'static str, value: String| {
            value
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|_| ConfigParseErrorKind::InvalidEnvVar { name, value })
        };
        let total = parse(Self::TOTAL_ENV, total)?;
        let process = match lookup(Self::PROCESS_ENV) {
            Some(value) => parse(Self::PROCESS_ENV, value)?,
            None => one(),
        };
        let config = Self {
            total,
            process,
            address: lookup(Self::ADDRESS_ENV).filter(|addr| !addr.is_empty()),
        };
        config.validate()?;
        Ok(Some(config))
    }
}
