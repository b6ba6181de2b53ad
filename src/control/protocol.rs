// SPDX-License-Identifier: GPL-3.0-only

//! Control socket wire format
//!
//! One JSON document per line in each direction. A connection carries any
//! number of request/response pairs, except `logs`, which turns the rest of
//! the connection into a stream of [`Response::Log`] lines.

use super::StatusReport;
use crate::errors::ControlError;
use crate::logging::LogLine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Start,
    Stop,
    Restart,
    Status,
    /// Replay at most `lines` of history, then follow
    Logs { lines: Option<usize> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Done { message: String },
    Status { report: StatusReport },
    Log { line: LogLine },
    /// The client fell behind and `count` lines were dropped
    Skipped { count: u64 },
    Error { error: ControlError },
}

impl Response {
    pub fn done(message: impl Into<String>) -> Self {
        Response::Done {
            message: message.into(),
        }
    }

    /// Map a command result onto a response
    pub fn from_result(result: Result<String, ControlError>) -> Self {
        match result {
            Ok(message) => Response::done(message),
            Err(error) => Response::Error { error },
        }
    }
}

/// Serialise one message, newline included
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ControlError> {
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| ControlError::Transport(format!("encode failed: {}", e)))?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ControlError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| ControlError::Transport(format!("malformed message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Missing;

    #[test]
    fn test_request_wire_format() {
        let bytes = encode(&Request::Logs { lines: Some(20) }).unwrap();
        assert_eq!(bytes, b"{\"command\":\"logs\",\"lines\":20}\n");

        let request: Request = decode("{\"command\":\"restart\"}\n").unwrap();
        assert_eq!(request, Request::Restart);
    }

    #[test]
    fn test_error_response_keeps_kind() {
        let response = Response::Error {
            error: ControlError::NotFound(Missing::Pipeline),
        };
        let line = String::from_utf8(encode(&response).unwrap()).unwrap();
        match decode::<Response>(&line).unwrap() {
            Response::Error { error } => assert_eq!(error.kind(), "no_pipeline"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_is_transport_error() {
        let err = decode::<Request>("{\"command\":\"reboot\"}").unwrap_err();
        assert_eq!(err.kind(), "transport");
    }
}
