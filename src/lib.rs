// Copyright 2020 Joyent, Inc.

//! tcf-dispatch: the message dispatcher for a TCF debug backend
//!
//! A debug adapter talks to its microcontroller backend over one persistent
//! socket using a TCF-derived text protocol. Many logical operations
//! (breakpoint sets, expression evaluation, run control, register reads)
//! are in flight at once over that single ordered stream. This crate frames
//! and serializes the traffic, correlates results with their commands, fans
//! events out to per-service handlers and surfaces flow-control and progress
//! signals.
//!
//! Protocol definition
//!
//! A frame is a sequence of UTF-8 fields separated by NUL (`0x00`) and closed
//! by the two byte end marker `0x03 0x01` (ETX SOH). The first field is a one
//! character kind:
//!
//! * `C`  Command: token, service, command, then each argument JSON-encoded
//!        and followed by NUL.
//!
//! * `R`  Result: token, error report (JSON or empty), result payload.
//!
//! * `P`  Progress: token, JSON object with `ProgressComplete`,
//!        `ProgressTotal` and `Description`.
//!
//! * `E`  Event: service, event name, then each argument JSON-encoded and
//!        followed by NUL.
//!
//! * `F`  Flow control: integer congestion level.
//!
//! * `N`  Unknown: opaque.
//!
//! A command with token `1` to `Breakpoints`/`add` with a single argument is
//! sent as:
//!
//! ```text
//! C\0 1\0 Breakpoints\0 add\0 {"File":"main.c","Line":29}\0 \x03\x01
//! ```
//!
//! (spaces added for legibility). Tokens are allocated sequentially from 1,
//! scoped to the connection, and never reused.

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod locator;
pub mod pending;
pub mod protocol;
pub mod server;

pub use client::{connect, Connection};
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, PendingCommand, Progress};
pub use error::{CommandError, DispatchError};
pub use protocol::{Message, TcfCodec, TcfParseError};
