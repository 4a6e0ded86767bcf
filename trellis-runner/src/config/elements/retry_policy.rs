// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

/// How many times a spec is attempted, and what ends the attempts early.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RetryPolicy {
    /// Attempt the spec once.
    #[default]
    Once,

    /// Retry a failing spec, stopping at the first pass.
    FlakeAttempts {
        /// The maximum number of attempts, including the first.
        attempts: NonZeroU32,
    },

    /// Repeat a passing spec, stopping at the first failure.
    MustPassRepeatedly {
        /// The number of attempts that must all pass.
        attempts: NonZeroU32,
    },
}

impl RetryPolicy {
    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Once => 1,
            Self::FlakeAttempts { attempts } | Self::MustPassRepeatedly { attempts } => {
                attempts.get()
            }
        }
    }

    /// Builds a policy from decorator arguments. Validation has already rejected zero and the
    /// combination of both.
    pub(crate) fn from_decorators(flake: Option<u32>, repeat: Option<u32>) -> Option<Self> {
        if let Some(attempts) = flake.and_then(NonZeroU32::new) {
            Some(Self::FlakeAttempts { attempts })
        } else {
            repeat
                .and_then(NonZeroU32::new)
                .map(|attempts| Self::MustPassRepeatedly { attempts })
        }
    }
}
