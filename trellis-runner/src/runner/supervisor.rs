// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::reporter::CancelReason;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// A cancellation that has been requested, with the message recorded on interrupted specs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cancellation {
    pub(crate) reason: CancelReason,
    pub(crate) message: &'static str,
}

impl Cancellation {
    fn new(reason: CancelReason) -> Self {
        let message = match reason {
            CancelReason::FailFast => "Aborted after a failure (fail-fast)",
            CancelReason::SuiteAbort => "Suite aborted",
            CancelReason::ParallelAbort => "Suite aborted by another process",
            CancelReason::Timeout => "Interrupted by suite timeout",
            CancelReason::Signal => "Interrupted by signal",
            CancelReason::Interrupt => "Interrupted by User",
        };
        Self { reason, message }
    }
}

/// A handle used to stop a run from outside.
///
/// Aborting lets the running spec finish and stops scheduling; interrupting also cuts the running
/// spec short. Cancelling more than once keeps the most severe reason.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    sender: Arc<watch::Sender<Option<Cancellation>>>,
}

impl AbortHandle {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Stops scheduling specs. The running spec finishes normally.
    pub fn abort(&self) {
        self.cancel(CancelReason::SuiteAbort);
    }

    /// Interrupts the running spec and stops scheduling specs.
    pub fn interrupt(&self) {
        self.cancel(CancelReason::Interrupt);
    }

    /// Returns the reason the run was cancelled, if it was.
    pub fn reason(&self) -> Option<CancelReason> {
        self.current().map(|c| c.reason)
    }

    /// Returns true if the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        self.cancel_with(Cancellation::new(reason))
    }

    pub(crate) fn cancel_with_message(&self, reason: CancelReason, message: &'static str) -> bool {
        self.cancel_with(Cancellation { reason, message })
    }

    /// Records `cancellation` unless an equally or more severe one is already recorded. Returns
    /// true if it was recorded.
    fn cancel_with(&self, cancellation: Cancellation) -> bool {
        let changed = self.sender.send_if_modified(|current| match current {
            Some(existing) if existing.reason >= cancellation.reason => false,
            _ => {
                *current = Some(cancellation);
                true
            }
        });
        if changed {
            debug!(reason = %cancellation.reason, "run cancelled");
        }
        changed
    }

    pub(crate) fn current(&self) -> Option<Cancellation> {
        *self.sender.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Cancellation>> {
        self.sender.subscribe()
    }
}

/// Waits until a cancellation that interrupts the running spec is recorded.
pub(crate) async fn interrupted(receiver: &mut watch::Receiver<Option<Cancellation>>) -> Cancellation {
    let found = receiver
        .wait_for(|c| c.is_some_and(|c| c.reason.interrupts()))
        .await
        .ok()
        .and_then(|c| *c);
    match found {
        Some(cancellation) => cancellation,
        // The handle outlives every receiver during a run.
        None => std::future::pending().await,
    }
}
