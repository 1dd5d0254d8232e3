// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io;
use std::str;

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::pending::Token;

/// Field separator.
pub const NIL: char = '\x00';
/// End-of-message marker closing every frame.
pub const EOM: &str = "\x03\x01";

const EOM_BYTES: &[u8] = b"\x03\x01";

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub enum TcfParseError {
    TooFewParts,
    BadTermination,
    InvalidToken(String),
    InvalidCongestion(String),
    TooLong(usize),
    InvalidUtf8,
    Io(io::Error),
}

impl fmt::Display for TcfParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcfParseError::TooFewParts => write!(f, "message has too few parts"),
            TcfParseError::BadTermination => {
                write!(f, "message has bad termination")
            }
            TcfParseError::InvalidToken(t) => {
                write!(f, "message has invalid token: {:?}", t)
            }
            TcfParseError::InvalidCongestion(c) => {
                write!(f, "message has invalid congestion level: {:?}", c)
            }
            TcfParseError::TooLong(max) => {
                write!(f, "message exceeds maximum length of {} bytes", max)
            }
            TcfParseError::InvalidUtf8 => {
                write!(f, "message is not valid UTF-8")
            }
            TcfParseError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TcfParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TcfParseError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TcfParseError {
    fn from(error: io::Error) -> Self {
        TcfParseError::Io(error)
    }
}

impl From<TcfParseError> for io::Error {
    fn from(error: TcfParseError) -> Self {
        match error {
            TcfParseError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// One TCF frame. JSON-carrying fields are kept as their raw wire text;
/// see [`stringify`] and [`unstringify`] for the conversions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command {
        token: Token,
        service: String,
        command: String,
        args: Vec<String>,
    },
    Result {
        token: Token,
        error: String,
        payload: String,
    },
    Progress {
        token: Token,
        payload: String,
    },
    Event {
        service: String,
        name: String,
        args: Vec<String>,
    },
    FlowControl {
        congestion: i64,
    },
    Unknown {
        fields: Vec<String>,
    },
    Unrecognized {
        kind: String,
        fields: Vec<String>,
    },
}

impl Message {
    pub fn command(
        token: Token,
        service: &str,
        command: &str,
        args: &[Value],
    ) -> Result<Message, serde_json::Error> {
        Ok(Message::Command {
            token,
            service: service.to_string(),
            command: command.to_string(),
            args: stringify(args)?,
        })
    }

    pub fn event(
        service: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Message, serde_json::Error> {
        Ok(Message::Event {
            service: service.to_string(),
            name: name.to_string(),
            args: stringify(args)?,
        })
    }

    /// Build an `R` frame. `None` for `error` means success.
    pub fn result(
        token: Token,
        error: Option<&Value>,
        payload: &Value,
    ) -> Result<Message, serde_json::Error> {
        let error = match error {
            Some(report) => serde_json::to_string(report)?,
            None => String::new(),
        };
        Ok(Message::Result {
            token,
            error,
            payload: serde_json::to_string(payload)?,
        })
    }

    pub fn progress(
        token: Token,
        payload: &Value,
    ) -> Result<Message, serde_json::Error> {
        Ok(Message::Progress {
            token,
            payload: serde_json::to_string(payload)?,
        })
    }

    pub fn flow_control(congestion: i64) -> Message {
        Message::FlowControl { congestion }
    }

    pub fn kind(&self) -> &str {
        match self {
            Message::Command { .. } => "C",
            Message::Result { .. } => "R",
            Message::Progress { .. } => "P",
            Message::Event { .. } => "E",
            Message::FlowControl { .. } => "F",
            Message::Unknown { .. } => "N",
            Message::Unrecognized { kind, .. } => kind,
        }
    }

    /// Decode one complete frame.
    pub fn parse(data: &str) -> Result<Message, TcfParseError> {
        let mut fields: Vec<&str> = data.split(NIL).collect();

        if fields.len() < 3 {
            return Err(TcfParseError::TooFewParts);
        }
        if fields.pop() != Some(EOM) {
            return Err(TcfParseError::BadTermination);
        }

        let kind = fields.remove(0);
        let mut rest = fields.into_iter();

        let msg = match kind {
            "C" => Message::Command {
                token: parse_token(rest.next())?,
                service: next_string(&mut rest),
                command: next_string(&mut rest),
                args: rest.map(String::from).collect(),
            },
            "R" => Message::Result {
                token: parse_token(rest.next())?,
                error: next_string(&mut rest),
                payload: next_string(&mut rest),
            },
            "P" => Message::Progress {
                token: parse_token(rest.next())?,
                payload: next_string(&mut rest),
            },
            "E" => Message::Event {
                service: next_string(&mut rest),
                name: next_string(&mut rest),
                args: rest.map(String::from).collect(),
            },
            "F" => {
                let level = rest.next().unwrap_or("");
                let congestion = level.trim().parse::<i64>().map_err(|_| {
                    TcfParseError::InvalidCongestion(level.to_string())
                })?;
                Message::FlowControl { congestion }
            }
            "N" => Message::Unknown {
                fields: rest.map(String::from).collect(),
            },
            other => Message::Unrecognized {
                kind: other.to_string(),
                fields: rest.map(String::from).collect(),
            },
        };

        Ok(msg)
    }

    /// Render the frame as wire text: every field is followed by a NUL and
    /// the frame is closed by the end marker.
    pub fn encode(&self) -> String {
        let mut fields: Vec<String> = Vec::new();
        match self {
            Message::Command {
                token,
                service,
                command,
                args,
            } => {
                fields.push(token.to_string());
                fields.push(service.clone());
                fields.push(command.clone());
                fields.extend(args.iter().cloned());
            }
            Message::Result {
                token,
                error,
                payload,
            } => {
                fields.push(token.to_string());
                fields.push(error.clone());
                fields.push(payload.clone());
            }
            Message::Progress { token, payload } => {
                fields.push(token.to_string());
                fields.push(payload.clone());
            }
            Message::Event {
                service,
                name,
                args,
            } => {
                fields.push(service.clone());
                fields.push(name.clone());
                fields.extend(args.iter().cloned());
            }
            Message::FlowControl { congestion } => {
                fields.push(congestion.to_string());
            }
            Message::Unknown { fields: f }
            | Message::Unrecognized { fields: f, .. } => {
                fields.extend(f.iter().cloned());
            }
        }

        let mut out = String::with_capacity(
            fields.iter().map(|f| f.len() + 1).sum::<usize>() + 4,
        );
        out.push_str(self.kind());
        out.push(NIL);
        for field in fields {
            out.push_str(&field);
            out.push(NIL);
        }
        out.push_str(EOM);
        out
    }
}

fn parse_token(field: Option<&str>) -> Result<Token, TcfParseError> {
    let field = field.unwrap_or("");
    field
        .trim()
        .parse::<Token>()
        .map_err(|_| TcfParseError::InvalidToken(field.to_string()))
}

fn next_string<'a, I: Iterator<Item = &'a str>>(fields: &mut I) -> String {
    fields.next().map(String::from).unwrap_or_default()
}

/// JSON-encode each argument individually.
pub fn stringify(args: &[Value]) -> Result<Vec<String>, serde_json::Error> {
    args.iter().map(serde_json::to_string).collect()
}

/// Decode argument fields. An empty field stands for "no value".
pub fn unstringify(fields: &[String]) -> Result<Vec<Value>, serde_json::Error> {
    fields.iter().map(|f| parse_field(f)).collect()
}

pub fn parse_field(field: &str) -> Result<Value, serde_json::Error> {
    if field.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_str(field)
    }
}

/// Make a frame printable for logs. Never apply this to wire data.
pub fn escape_for_log(frame: &str) -> String {
    frame
        .chars()
        .map(|c| match c {
            '\x00' => ' ',
            '\x03' => '<',
            '\x01' => '>',
            other => other,
        })
        .collect()
}

/// Splits a byte stream into frames on the end marker.
#[derive(Debug)]
pub struct TcfCodec {
    max_length: usize,
    // Offset already scanned for the end marker.
    next_index: usize,
}

impl TcfCodec {
    pub fn new(max_length: usize) -> TcfCodec {
        TcfCodec {
            max_length,
            next_index: 0,
        }
    }
}

impl Default for TcfCodec {
    fn default() -> Self {
        TcfCodec::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for TcfCodec {
    type Item = String;
    type Error = TcfParseError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, TcfParseError> {
        // The marker may straddle the previous read boundary.
        let start = self.next_index.saturating_sub(1).min(buf.len());
        let found = buf[start..]
            .windows(EOM_BYTES.len())
            .position(|w| w == EOM_BYTES);

        match found {
            Some(pos) => {
                let end = start + pos + EOM_BYTES.len();
                self.next_index = 0;
                if end > self.max_length {
                    return Err(TcfParseError::TooLong(self.max_length));
                }
                let frame = buf.split_to(end);
                let text = str::from_utf8(&frame)
                    .map_err(|_| TcfParseError::InvalidUtf8)?;
                Ok(Some(text.to_string()))
            }
            None => {
                if buf.len() > self.max_length {
                    return Err(TcfParseError::TooLong(self.max_length));
                }
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for TcfCodec {
    type Error = TcfParseError;

    fn encode(
        &mut self,
        item: String,
        buf: &mut BytesMut,
    ) -> Result<(), TcfParseError> {
        buf.reserve(item.len());
        buf.put_slice(item.as_bytes());
        Ok(())
    }
}
