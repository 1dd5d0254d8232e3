// Copyright 2020 Joyent, Inc.

//! Correlation of commands with their results.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::DispatchError;

pub type Token = u64;

/// What a pending command eventually resolves to.
pub type Reply = Result<Value, DispatchError>;

/// Tokens are scoped to one connection: they start at 1 and are never
/// reused.
#[derive(Debug, Default)]
pub struct TokenSource {
    value: Token,
}

impl TokenSource {
    pub fn new() -> Self {
        TokenSource { value: 0 }
    }

    pub fn allocate(&mut self) -> Token {
        self.value += 1;
        self.value
    }
}

impl Iterator for TokenSource {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        Some(self.allocate())
    }
}

#[derive(Debug)]
pub struct PendingRequest {
    pub service: String,
    pub command: String,
    sender: oneshot::Sender<Reply>,
}

impl PendingRequest {
    /// Hand the reply to the waiting caller. Returns false if the caller
    /// has gone away.
    pub fn complete(self, reply: Reply) -> bool {
        self.sender.send(reply).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<Token, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            entries: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        token: Token,
        service: &str,
        command: &str,
    ) -> oneshot::Receiver<Reply> {
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(
            token,
            PendingRequest {
                service: service.to_string(),
                command: command.to_string(),
                sender,
            },
        );
        receiver
    }

    pub fn remove(&mut self, token: Token) -> Option<PendingRequest> {
        self.entries.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(Token, PendingRequest)> {
        self.entries.drain().collect()
    }
}
