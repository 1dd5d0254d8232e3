// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io;

use serde_json::Value;

use crate::pending::Token;
use crate::protocol::TcfParseError;

/// A command rejected by the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub service: String,
    pub command: String,
    pub token: Token,
    pub code: Option<i64>,
    pub message: String,
    /// The decoded error report, or the raw text when it is not JSON.
    pub report: Value,
}

impl CommandError {
    pub fn from_report(
        service: &str,
        command: &str,
        token: Token,
        report: &str,
    ) -> CommandError {
        let parsed: Value = serde_json::from_str(report)
            .unwrap_or_else(|_| Value::String(report.to_string()));

        let message = match &parsed {
            Value::Object(map) => map
                .get("Format")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| report.to_string()),
            Value::String(s) => s.clone(),
            _ => report.to_string(),
        };

        CommandError {
            service: service.to_string(),
            command: command.to_string(),
            token,
            code: parsed.get("Code").and_then(Value::as_i64),
            message,
            report: parsed,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{} failed: {}", self.service, self.command, self.message)
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug)]
pub enum DispatchError {
    Parse(TcfParseError),
    Io(io::Error),
    Json(serde_json::Error),
    Command(CommandError),
    Timeout { token: Token },
    ConnectionClosed,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DispatchError::Parse(e) => write!(f, "framing error: {}", e),
            DispatchError::Io(e) => write!(f, "transport error: {}", e),
            DispatchError::Json(e) => write!(f, "invalid JSON: {}", e),
            DispatchError::Command(e) => write!(f, "{}", e),
            DispatchError::Timeout { token } => {
                write!(f, "command {} timed out", token)
            }
            DispatchError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Parse(e) => Some(e),
            DispatchError::Io(e) => Some(e),
            DispatchError::Json(e) => Some(e),
            DispatchError::Command(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TcfParseError> for DispatchError {
    fn from(error: TcfParseError) -> Self {
        match error {
            TcfParseError::Io(e) => DispatchError::Io(e),
            other => DispatchError::Parse(other),
        }
    }
}

impl From<io::Error> for DispatchError {
    fn from(error: io::Error) -> Self {
        DispatchError::Io(error)
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(error: serde_json::Error) -> Self {
        DispatchError::Json(error)
    }
}

impl From<CommandError> for DispatchError {
    fn from(error: CommandError) -> Self {
        DispatchError::Command(error)
    }
}
