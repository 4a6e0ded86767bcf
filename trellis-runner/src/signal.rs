// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling signals in trellis.
//!
//! Shutdown signals interrupt the run. Info signals request a progress report for the running
//! spec.

use crate::{errors::SignalHandlerSetupError, reporter::CancelReason};

/// The kind of signal handling to set up for a suite run.
///
/// A `SignalHandlerKind` can be passed into
/// [`SuiteRunnerBuilder::build`](crate::runner::SuiteRunnerBuilder::build).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler. Capture interrupt, termination and info signals depending on
    /// the platform.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        match self {
            Self::Standard => SignalHandler::new(),
            Self::Noop => Ok(SignalHandler::noop()),
        }
    }
}

/// The signal handler implementation.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signals: Option<imp::Signals>,
}

impl SignalHandler {
    /// Creates a new `SignalHandler` that handles Ctrl-C and other signals.
    pub(crate) fn new() -> Result<Self, SignalHandlerSetupError> {
        let signals = imp::Signals::new()?;
        Ok(Self {
            signals: Some(signals),
        })
    }

    /// Creates a new `SignalHandler` that does nothing.
    pub(crate) fn noop() -> Self {
        Self { signals: None }
    }

    /// Waits for the next signal. Returns `None` once no more signals can arrive.
    pub(crate) async fn recv(&mut self) -> Option<SignalEvent> {
        match &mut self.signals {
            Some(signals) => signals.recv().await,
            None => None,
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::signal::unix::{Signal, SignalKind, signal};

    /// Signals for SIGINT, SIGTERM, SIGHUP and SIGUSR1 on Unix, plus SIGINFO where it exists.
    #[derive(Debug)]
    pub(super) struct Signals {
        sigint: SignalWithDone,
        sighup: SignalWithDone,
        sigterm: SignalWithDone,
        sigusr1: SignalWithDone,
        // Only exists on platforms with SIGINFO.
        siginfo: Option<SignalWithDone>,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let sigint = SignalWithDone::new(SignalKind::interrupt())?;
            let sighup = SignalWithDone::new(SignalKind::hangup())?;
            let sigterm = SignalWithDone::new(SignalKind::terminate())?;
            let sigusr1 = SignalWithDone::new(SignalKind::user_defined1())?;
            let siginfo = SignalWithDone::info()?;

            Ok(Self {
                sigint,
                sighup,
                sigterm,
                sigusr1,
                siginfo,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<SignalEvent> {
            loop {
                tokio::select! {
                    recv = self.sigint.signal.recv(), if !self.sigint.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Interrupt)),
                            None => self.sigint.done = true,
                        }
                    }
                    recv = self.sighup.signal.recv(), if !self.sighup.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Hangup)),
                            None => self.sighup.done = true,
                        }
                    }
                    recv = self.sigterm.signal.recv(), if !self.sigterm.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Shutdown(ShutdownEvent::Term)),
                            None => self.sigterm.done = true,
                        }
                    }
                    recv = self.sigusr1.signal.recv(), if !self.sigusr1.done => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Info),
                            None => self.sigusr1.done = true,
                        }
                    }
                    recv = recv_info(self.siginfo.as_mut()), if info_pending(self.siginfo.as_ref()) => {
                        match recv {
                            Some(()) => break Some(SignalEvent::Info),
                            None => {
                                if let Some(siginfo) = &mut self.siginfo {
                                    siginfo.done = true;
                                }
                            }
                        }
                    }
                    else => {
                        break None
                    }
                }
            }
        }
    }

    #[derive(Debug)]
    struct SignalWithDone {
        signal: Signal,
        done: bool,
    }

    impl SignalWithDone {
        fn new(kind: SignalKind) -> std::io::Result<Self> {
            let signal = signal(kind)?;
            Ok(Self {
                signal,
                done: false,
            })
        }

        #[cfg(any(
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd",
        ))]
        fn info() -> std::io::Result<Option<Self>> {
            Self::new(SignalKind::info()).map(Some)
        }

        #[cfg(not(any(
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd",
        )))]
        fn info() -> std::io::Result<Option<Self>> {
            Ok(None)
        }
    }

    fn info_pending(siginfo: Option<&SignalWithDone>) -> bool {
        siginfo.is_some_and(|siginfo| !siginfo.done)
    }

    async fn recv_info(siginfo: Option<&mut SignalWithDone>) -> Option<()> {
        match siginfo {
            Some(siginfo) => siginfo.signal.recv().await,
            None => std::future::pending().await,
        }
    }

}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::signal::windows::{CtrlC, ctrl_c};

    #[derive(Debug)]
    pub(super) struct Signals {
        ctrl_c: CtrlC,
        ctrl_c_done: bool,
    }

    impl Signals {
        pub(super) fn new() -> std::io::Result<Self> {
            let ctrl_c = ctrl_c()?;
            Ok(Self {
                ctrl_c,
                ctrl_c_done: false,
            })
        }

        pub(super) async fn recv(&mut self) -> Option<SignalEvent> {
            if self.ctrl_c_done {
                return None;
            }

            match self.ctrl_c.recv().await {
                Some(()) => Some(SignalEvent::Shutdown(ShutdownEvent::Interrupt)),
                None => {
                    self.ctrl_c_done = true;
                    None
                }
            }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SignalEvent {
    Shutdown(ShutdownEvent),
    #[cfg_attr(not(unix), expect(dead_code))]
    Info,
}

// A signal event that should interrupt the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ShutdownEvent {
    #[cfg(unix)]
    Hangup,
    #[cfg(unix)]
    Term,
    Interrupt,
}

impl ShutdownEvent {
    pub(crate) fn cancel_reason(self) -> CancelReason {
        match self {
            #[cfg(unix)]
            Self::Hangup | Self::Term => CancelReason::Signal,
            Self::Interrupt => CancelReason::Interrupt,
        }
    }

    /// Returns the reason recorded on interrupted specs.
    pub(crate) fn reason(self) -> &'static str {
        match self {
            #[cfg(unix)]
            Self::Hangup => "Interrupted by SIGHUP",
            #[cfg(unix)]
            Self::Term => "Interrupted by SIGTERM",
            Self::Interrupt => "Interrupted by User",
        }
    }
}
