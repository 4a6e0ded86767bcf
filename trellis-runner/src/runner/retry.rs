// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{config::RetryPolicy, reporter::SpecState};

/// Decides how many times a spec is attempted.
///
/// One controller is created per spec per run.
#[derive(Clone, Debug)]
pub(crate) struct RetryController {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryController {
    /// Creates a controller. A configured override replaces the spec's own policy.
    pub(crate) fn new(spec_policy: RetryPolicy, override_policy: Option<RetryPolicy>) -> Self {
        Self {
            policy: override_policy.unwrap_or(spec_policy),
            attempts: 0,
        }
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Starts the next attempt and returns its 1-based index.
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Returns true if an attempt of the current index ending in `state` is followed by another.
    pub(crate) fn should_retry(&self, state: SpecState) -> bool {
        if self.attempts >= self.policy.max_attempts() {
            return false;
        }
        match state {
            // Skips, interrupts and aborts end the spec outright.
            SpecState::Pending
            | SpecState::Skipped
            | SpecState::Interrupted
            | SpecState::Aborted => false,
            SpecState::Passed => matches!(self.policy, RetryPolicy::MustPassRepeatedly { .. }),
            SpecState::Failed | SpecState::Panicked | SpecState::Timedout => {
                matches!(self.policy, RetryPolicy::FlakeAttempts { .. })
            }
        }
    }
}
