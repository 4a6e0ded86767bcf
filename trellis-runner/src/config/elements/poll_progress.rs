// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

/// When to emit automatic progress reports for a running spec.
///
/// With `after` unset no automatic reports are emitted. With `interval` unset, one report is
/// emitted after `after` and no more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollProgress {
    /// Emit the first report this long after the spec starts.
    pub after: Option<Duration>,

    /// Emit subsequent reports at this interval.
    pub interval: Option<Duration>,
}

impl PollProgress {
    /// Fills unset fields from `defaults`. Values set on the spec win.
    pub fn or(self, defaults: PollProgress) -> Self {
        Self {
            after: self.after.or(defaults.after),
            interval: self.interval.or(defaults.interval),
        }
    }

    /// Returns the delay before the `n`th automatic report, counting from zero and measured from
    /// the start of the spec.
    pub(crate) fn nth_deadline(&self, n: u32) -> Option<Duration> {
        let after = self.after?;
        match (n, self.interval) {
            (0, _) => Some(after),
            (n, Some(interval)) => Some(after + interval.saturating_mul(n)),
            (_, None) => None,
        }
    }
}
