// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1534;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub host: String,
    pub port: u16,
    /// `None` leaves commands pending until their result arrives.
    pub command_timeout: Option<Duration>,
    /// Reject every pending command with `ConnectionClosed` on close. When
    /// false the entries are dropped instead, which callers also observe as
    /// `ConnectionClosed`.
    pub reject_pending_on_close: bool,
    pub max_frame_length: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            command_timeout: None,
            reject_pending_on_close: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl DispatcherConfig {
    pub fn new(host: &str, port: u16) -> Self {
        DispatcherConfig {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_reject_pending_on_close(mut self, reject: bool) -> Self {
        self.reject_pending_on_close = reject;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}
