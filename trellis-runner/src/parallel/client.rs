// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ParallelServer, Request, Response, TcpClient};
use crate::{
    config::ParallelConfig,
    errors::{ConfigParseErrorKind, ParallelError},
    reporter::SuiteReport,
};
use futures::{FutureExt, future::BoxFuture};
use std::{fmt, sync::Arc};

/// A connection to the rendezvous server of a parallel run.
pub trait ParallelClient: Send + Sync + fmt::Debug {
    /// Sends a request and waits for the response.
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, ParallelError>>;
}

/// A client for a server in the same process. Useful for running processes as threads.
///
/// Dropping the client marks its process as gone, unless it already handed in its report.
#[derive(Debug)]
pub struct LocalClient {
    server: Arc<ParallelServer>,
    process: usize,
}

impl LocalClient {
    /// Creates a client for process `process`.
    pub fn new(server: Arc<ParallelServer>, process: usize) -> Self {
        Self { server, process }
    }
}

impl ParallelClient for LocalClient {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, ParallelError>> {
        async move { Ok(self.server.handle(request).await) }.boxed()
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.server.mark_gone(self.process);
    }
}

/// This process's place in a parallel run and its connection to the other processes.
///
/// Pass a session to
/// [`SuiteRunnerBuilder::set_parallel_session`](crate::runner::SuiteRunnerBuilder::set_parallel_session).
#[derive(Clone, Debug)]
pub struct ParallelSession {
    config: ParallelConfig,
    client: Arc<dyn ParallelClient>,
}

impl ParallelSession {
    /// Creates a session from a config and a client.
    pub fn new(config: ParallelConfig, client: Arc<dyn ParallelClient>) -> Self {
        Self { config, client }
    }

    /// Creates a session for process `process` of a run hosted by `server` in this process.
    pub fn local(
        server: &Arc<ParallelServer>,
        process: usize,
    ) -> Result<Self, ConfigParseErrorKind> {
        let config = ParallelConfig::new(process, server.total().get())?;
        let client = LocalClient::new(Arc::clone(server), process);
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Creates a session that connects to the server at `config.address` over TCP. Returns `None`
    /// if no address is configured.
    ///
    /// The connection is made on first use.
    pub fn connect(config: &ParallelConfig) -> Option<Self> {
        let address = config.address.clone()?;
        let client = TcpClient::new(address);
        Some(Self::new(config.clone(), Arc::new(client)))
    }

    /// Returns this process's place in the run.
    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub(crate) fn coordinator(&self) -> Coordinator {
        Coordinator {
            client: Arc::clone(&self.client),
            process: self.config.process.get(),
        }
    }
}

/// Typed requests on top of a [`ParallelClient`].
#[derive(Clone, Debug)]
pub(crate) struct Coordinator {
    client: Arc<dyn ParallelClient>,
    process: usize,
}

impl Coordinator {
    async fn call(&self, request: Request) -> Result<Response, ParallelError> {
        match self.client.call(request).await? {
            Response::ProcessFailure { process, message } => {
                Err(ParallelError::ProcessFailure { process, message })
            }
            Response::Error { message } => Err(ParallelError::Server(message)),
            response => Ok(response),
        }
    }

    pub(crate) async fn register(&self) -> Result<(), ParallelError> {
        let process = self.process;
        expect_ok(self.call(Request::Register { process }).await?)
    }

    pub(crate) async fn claim_unit(&self) -> Result<usize, ParallelError> {
        match self.call(Request::ClaimUnit).await? {
            Response::Unit { index } => Ok(index),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn post_before_suite(
        &self,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ParallelError> {
        expect_ok(self.call(Request::PostBeforeSuite { payload }).await?)
    }

    pub(crate) async fn await_before_suite(&self) -> Result<Vec<u8>, ParallelError> {
        match self.call(Request::AwaitBeforeSuite).await? {
            Response::BeforeSuite { payload } => Ok(payload),
            Response::BeforeSuiteFailed => Err(ParallelError::BeforeSuiteFailed),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn post_report(&self, report: SuiteReport) -> Result<(), ParallelError> {
        let request = Request::PostReport {
            process: self.process,
            report: Box::new(report),
        };
        expect_ok(self.call(request).await?)
    }

    /// Waits for every secondary and returns the ones that went away without a report.
    pub(crate) async fn await_secondaries(&self) -> Result<Vec<usize>, ParallelError> {
        match self.call(Request::AwaitSecondaries).await? {
            Response::Secondaries { failed } => Ok(failed),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn abort(&self) -> Result<(), ParallelError> {
        expect_ok(self.call(Request::Abort).await?)
    }

    pub(crate) async fn should_abort(&self) -> Result<bool, ParallelError> {
        match self.call(Request::ShouldAbort).await? {
            Response::ShouldAbort { abort } => Ok(abort),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) async fn collect_reports(&self) -> Result<Vec<SuiteReport>, ParallelError> {
        match self.call(Request::CollectReports).await? {
            Response::Reports { reports } => Ok(reports),
            other => Err(unexpected(other)),
        }
    }
}

fn expect_ok(response: Response) -> Result<(), ParallelError> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: Response) -> ParallelError {
    ParallelError::Server(format!("unexpected response: {response:?}"))
}
