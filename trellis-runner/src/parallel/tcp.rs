// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The rendezvous protocol over TCP: one JSON-encoded [`Request`] or [`Response`] per line.

use super::{ParallelClient, ParallelServer, Request, Response};
use crate::errors::ParallelError;
use futures::{FutureExt, future::BoxFuture};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tracing::{debug, warn};

/// Serves `server` to every connection accepted on `listener`. Runs until accepting fails.
///
/// A connection that closes after registering marks its process as gone, unless the process
/// already handed in its report.
pub async fn serve(listener: TcpListener, server: Arc<ParallelServer>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "rendezvous connection accepted");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut process = None;
            if let Err(err) = serve_connection(stream, &server, &mut process).await {
                warn!(%peer, "rendezvous connection failed: {err}");
            }
            if let Some(process) = process {
                server.mark_gone(process);
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    server: &ParallelServer,
    process: &mut Option<usize>,
) -> Result<(), ParallelError> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let request: Request = serde_json::from_str(&line)?;
        if let Request::Register { process: p } = &request {
            *process = Some(*p);
        }
        let response = server.handle(request).await;
        write_line(&mut write, &response).await?;
    }
    Ok(())
}

async fn write_line<T: serde::Serialize>(
    write: &mut OwnedWriteHalf,
    message: &T,
) -> Result<(), ParallelError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

/// A client that talks to a rendezvous server over TCP.
///
/// A connection that fails is reopened by the next call. The server treats a closed connection as
/// a process that went away, so a reopened connection registers the process again first.
#[derive(Debug)]
pub struct TcpClient {
    address: String,
    state: Mutex<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    connection: Option<Connection>,
    registered: Option<usize>,
}

#[derive(Debug)]
struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl TcpClient {
    /// Creates a client for the server at `address`. The connection is made on first use.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Mutex::new(ClientState::default()),
        }
    }

    async fn connect(&self) -> Result<Connection, ParallelError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    async fn roundtrip(
        connection: &mut Connection,
        request: &Request,
    ) -> Result<Response, ParallelError> {
        write_line(&mut connection.write, request).await?;
        match connection.lines.next_line().await? {
            Some(line) => Ok(serde_json::from_str(&line)?),
            None => Err(ParallelError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "rendezvous server closed the connection",
            ))),
        }
    }
}

impl ParallelClient for TcpClient {
    fn call(&self, request: Request) -> BoxFuture<'_, Result<Response, ParallelError>> {
        async move {
            let mut state = self.state.lock().await;
            let mut connection = match state.connection.take() {
                Some(connection) => connection,
                None => {
                    let mut connection = self.connect().await?;
                    if let Some(process) = state.registered
                        && !matches!(request, Request::Register { .. })
                    {
                        debug!(process, "re-registering on a new rendezvous connection");
                        let register = Request::Register { process };
                        match Self::roundtrip(&mut connection, &register).await? {
                            Response::Ok => {}
                            other => {
                                return Err(ParallelError::Server(format!(
                                    "re-registering process {process} failed: {other:?}"
                                )));
                            }
                        }
                    }
                    connection
                }
            };
            // A connection that failed mid-request is dropped and reopened by the next call.
            let response = Self::roundtrip(&mut connection, &request).await?;
            if let (Request::Register { process }, Response::Ok) = (&request, &response) {
                state.registered = Some(*process);
            }
            state.connection = Some(connection);
            Ok(response)
        }
        .boxed()
    }
}
