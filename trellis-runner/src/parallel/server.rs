// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{helpers::lock, reporter::SuiteReport};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroUsize,
    sync::Mutex,
};
use tokio::sync::watch;
use tracing::debug;

/// A request from a process to the rendezvous server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    /// Announces a process. Sent once, before any other request.
    Register {
        /// The process's 1-based index.
        process: usize,
    },

    /// Reports that a process went away.
    Gone {
        /// The process's 1-based index.
        process: usize,
    },

    /// Claims the next scheduling unit.
    ClaimUnit,

    /// Publishes the primary's before-suite payload.
    PostBeforeSuite {
        /// The payload, or `None` if the primary phase failed.
        payload: Option<Vec<u8>>,
    },

    /// Waits for the before-suite payload.
    AwaitBeforeSuite,

    /// Hands in a secondary's report. The process is finished afterwards.
    PostReport {
        /// The process's 1-based index.
        process: usize,
        /// The process's report.
        report: Box<SuiteReport>,
    },

    /// Waits until every secondary has handed in its report or gone away.
    AwaitSecondaries,

    /// Asks every process to stop scheduling.
    Abort,

    /// Asks whether any process aborted.
    ShouldAbort,

    /// Returns every report handed in so far.
    CollectReports,
}

/// A response from the rendezvous server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "kebab-case")]
pub enum Response {
    /// The request was handled.
    Ok,

    /// The claimed unit. Indexes past the last unit mean there is no work left.
    Unit {
        /// The index of the unit.
        index: usize,
    },

    /// The primary's before-suite payload.
    BeforeSuite {
        /// The payload.
        payload: Vec<u8>,
    },

    /// The primary's before-suite phase failed.
    BeforeSuiteFailed,

    /// Whether any process aborted.
    ShouldAbort {
        /// True if a process aborted.
        abort: bool,
    },

    /// Every secondary has finished.
    Secondaries {
        /// Secondaries that went away without handing in a report.
        failed: Vec<usize>,
    },

    /// The reports handed in so far.
    Reports {
        /// The reports, ordered by process.
        reports: Vec<SuiteReport>,
    },

    /// A process the request depends on went away.
    ProcessFailure {
        /// The process that went away.
        process: usize,
        /// A description of the failure.
        message: String,
    },

    /// The request was invalid.
    Error {
        /// A description of the problem.
        message: String,
    },
}

/// The shared state of a parallel run.
///
/// One server is shared by every process of a run, either in memory through
/// [`LocalClient`](super::LocalClient) or over TCP through [`serve`](super::serve).
#[derive(Debug)]
pub struct ParallelServer {
    total: NonZeroUsize,
    state: Mutex<ServerState>,
    version: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct ServerState {
    next_unit: usize,
    registered: BTreeSet<usize>,
    gone: BTreeSet<usize>,
    reports: BTreeMap<usize, SuiteReport>,
    before_suite: BeforeSuiteState,
    abort: bool,
}

#[derive(Debug, Default)]
enum BeforeSuiteState {
    #[default]
    Pending,
    Ready(Vec<u8>),
    Failed,
}

impl ParallelServer {
    /// Creates a server for a run with `total` processes.
    pub fn new(total: NonZeroUsize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            total,
            state: Mutex::new(ServerState::default()),
            version,
        }
    }

    /// Returns the number of processes in the run.
    pub fn total(&self) -> NonZeroUsize {
        self.total
    }

    /// Handles one request. Requests that wait for other processes only return once the awaited
    /// state is reached.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Register { process } => {
                if process == 0 || process > self.total.get() {
                    return Response::Error {
                        message: format!(
                            "process {process} is out of range for {} processes",
                            self.total
                        ),
                    };
                }
                debug!(process, "process registered");
                self.update(|state| {
                    state.registered.insert(process);
                    // A process that reconnects is alive again.
                    state.gone.remove(&process);
                });
                Response::Ok
            }
            Request::Gone { process } => {
                self.mark_gone(process);
                Response::Ok
            }
            Request::ClaimUnit => self.update(|state| {
                let index = state.next_unit;
                state.next_unit += 1;
                Response::Unit { index }
            }),
            Request::PostBeforeSuite { payload } => {
                self.update(|state| {
                    state.before_suite = match payload {
                        Some(payload) => BeforeSuiteState::Ready(payload),
                        None => BeforeSuiteState::Failed,
                    };
                });
                Response::Ok
            }
            Request::AwaitBeforeSuite => {
                self.wait_until(|state| match &state.before_suite {
                    BeforeSuiteState::Ready(payload) => Some(Response::BeforeSuite {
                        payload: payload.clone(),
                    }),
                    BeforeSuiteState::Failed => Some(Response::BeforeSuiteFailed),
                    BeforeSuiteState::Pending if state.gone.contains(&1) => {
                        Some(Response::ProcessFailure {
                            process: 1,
                            message: "the primary process went away before publishing the \
                                      before-suite payload"
                                .to_owned(),
                        })
                    }
                    BeforeSuiteState::Pending => None,
                })
                .await
            }
            Request::PostReport { process, report } => {
                debug!(process, specs = report.spec_reports.len(), "report received");
                self.update(|state| {
                    state.gone.remove(&process);
                    state.reports.insert(process, *report);
                });
                Response::Ok
            }
            Request::AwaitSecondaries => {
                let total = self.total.get();
                self.wait_until(|state| {
                    let done = (2..=total)
                        .all(|p| state.reports.contains_key(&p) || state.gone.contains(&p));
                    done.then(|| Response::Secondaries {
                        failed: state.gone.iter().copied().filter(|p| *p != 1).collect(),
                    })
                })
                .await
            }
            Request::Abort => {
                self.update(|state| state.abort = true);
                Response::Ok
            }
            Request::ShouldAbort => Response::ShouldAbort {
                abort: lock(&self.state).abort,
            },
            Request::CollectReports => Response::Reports {
                reports: lock(&self.state).reports.values().cloned().collect(),
            },
        }
    }

    /// Records that a process went away. Processes that already handed in a report are finished
    /// and unaffected.
    pub fn mark_gone(&self, process: usize) {
        self.update(|state| {
            if !state.reports.contains_key(&process) {
                debug!(process, "process went away");
                state.gone.insert(process);
            }
        });
    }

    #[cfg(test)]
    pub(super) fn is_gone(&self, process: usize) -> bool {
        lock(&self.state).gone.contains(&process)
    }

    fn update<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        let result = f(&mut lock(&self.state));
        self.version.send_modify(|version| *version += 1);
        result
    }

    async fn wait_until<R>(&self, f: impl Fn(&ServerState) -> Option<R>) -> R {
        let mut changes = self.version.subscribe();
        loop {
            if let Some(result) = f(&lock(&self.state)) {
                return result;
            }
            if changes.changed().await.is_err() {
                // The sender lives as long as the server.
                return std::future::pending().await;
            }
        }
    }
}
