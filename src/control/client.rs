// SPDX-License-Identifier: GPL-3.0-only

//! CLI side of the control socket

use super::StatusReport;
use super::protocol::{self, Request, Response};
use crate::errors::{ControlError, Missing};
use crate::logging::LogLine;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Lines delivered to a `logs` follower
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Line(LogLine),
    Skipped(u64),
}

/// One open request; dropping it closes the connection
struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Closing the write half early would end a logs stream
    _write: OwnedWriteHalf,
}

impl Connection {
    async fn next(&mut self) -> Result<Option<Response>, ControlError> {
        match self.lines.next_line().await.map_err(transport)? {
            Some(line) => protocol::decode(&line).map(Some),
            None => Ok(None),
        }
    }
}

pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self, request: &Request) -> Result<Connection, ControlError> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                ControlError::NotFound(Missing::Daemon(self.socket.clone()))
            }
            _ => ControlError::Transport(format!("{}: {}", self.socket.display(), e)),
        })?;
        let (read, mut write) = stream.into_split();
        write
            .write_all(&protocol::encode(request)?)
            .await
            .map_err(transport)?;
        Ok(Connection {
            lines: BufReader::new(read).lines(),
            _write: write,
        })
    }

    /// Send one request and wait for its response
    pub async fn request(&self, request: &Request) -> Result<Response, ControlError> {
        let mut connection = self.connect(request).await?;
        match connection.next().await? {
            Some(Response::Error { error }) => Err(error),
            Some(response) => Ok(response),
            None => Err(ControlError::Transport(
                "daemon closed the connection".to_string(),
            )),
        }
    }

    /// Run a lifecycle command and return the daemon's message
    pub async fn command(&self, request: Request) -> Result<String, ControlError> {
        match self.request(&request).await? {
            Response::Done { message } => Ok(message),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn status(&self) -> Result<StatusReport, ControlError> {
        match self.request(&Request::Status).await? {
            Response::Status { report } => Ok(report),
            other => Err(unexpected(&other)),
        }
    }

    /// Follow the daemon's log stream until it ends
    ///
    /// Dropping the returned future detaches; the pipeline keeps running.
    pub async fn follow_logs<F>(&self, lines: Option<usize>, mut on_event: F) -> Result<(), ControlError>
    where
        F: FnMut(LogEvent),
    {
        let mut stream = self.connect(&Request::Logs { lines }).await?;
        while let Some(response) = stream.next().await? {
            match response {
                Response::Log { line } => on_event(LogEvent::Line(line)),
                Response::Skipped { count } => on_event(LogEvent::Skipped(count)),
                Response::Error { error } => return Err(error),
                other => return Err(unexpected(&other)),
            }
        }
        Ok(())
    }
}

fn transport(err: std::io::Error) -> ControlError {
    ControlError::Transport(err.to_string())
}

fn unexpected(response: &Response) -> ControlError {
    ControlError::Transport(format!("unexpected response {:?}", response))
}
