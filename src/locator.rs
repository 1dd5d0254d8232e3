// Copyright 2020 Joyent, Inc.

//! The `Locator` service: connection handshake and peer discovery.
//!
//! Both ends announce themselves with a `Hello` event listing the services
//! they offer. Other services should not be used before the agent's
//! `Hello` has arrived.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, info, o, warn, Logger};
use tokio::sync::watch;

use crate::dispatcher::{Dispatcher, EventHandler};
use crate::error::DispatchError;

pub const LOCATOR: &str = "Locator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Peer {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "OSName")]
    pub os_name: Option<String>,
    pub transport_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
}

type PeerMap = Arc<Mutex<HashMap<String, Peer>>>;

struct LocatorEvents {
    hello: watch::Sender<Option<Vec<String>>>,
    peers: PeerMap,
    log: Logger,
}

impl LocatorEvents {
    fn record_peer(&self, args: &[Value]) {
        match args.first().cloned().map(serde_json::from_value::<Peer>) {
            Some(Ok(peer)) => {
                debug!(self.log, "peer updated"; "id" => &peer.id);
                self.peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(peer.id.clone(), peer);
            }
            _ => warn!(self.log, "ignoring malformed peer"; "args" => ?args),
        }
    }
}

impl EventHandler for LocatorEvents {
    fn handle_event(&self, event: &str, args: &[Value]) {
        match event {
            "Hello" => {
                let services: Vec<String> = args
                    .first()
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                info!(self.log, "agent hello"; "services" => ?services);
                let _ = self.hello.send(Some(services));
            }
            "peerAdded" | "peerChanged" => self.record_peer(args),
            "peerRemoved" => {
                if let Some(id) = args.first().and_then(Value::as_str) {
                    debug!(self.log, "peer removed"; "id" => id);
                    self.peers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(id);
                }
            }
            "peerHeartBeat" => {
                debug!(self.log, "peer heartbeat"; "args" => ?args);
            }
            other => debug!(self.log, "unhandled event"; "event" => other),
        }
    }
}

pub struct Locator {
    dispatcher: Dispatcher,
    hello: watch::Receiver<Option<Vec<String>>>,
    peers: PeerMap,
}

impl Locator {
    /// Register for `Locator` events on `dispatcher`.
    pub fn attach(dispatcher: &Dispatcher) -> Locator {
        let (tx, rx) = watch::channel(None);
        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));

        dispatcher.register_event_handler(
            LOCATOR,
            LocatorEvents {
                hello: tx,
                peers: Arc::clone(&peers),
                log: dispatcher.logger().new(o!("service" => LOCATOR)),
            },
        );

        Locator {
            dispatcher: dispatcher.clone(),
            hello: rx,
            peers,
        }
    }

    /// Announce ourselves. We offer no services of our own.
    pub fn hello(&self) -> Result<(), DispatchError> {
        self.dispatcher.send_event(LOCATOR, "Hello", &[json!([])])
    }

    /// Wait for the agent's `Hello` and return the services it offers.
    pub async fn wait_for_hello(&self) -> Result<Vec<String>, DispatchError> {
        let mut rx = self.hello.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(services) = current {
                return Ok(services);
            }
            rx.changed()
                .await
                .map_err(|_| DispatchError::ConnectionClosed)?;
        }
    }

    /// Round trip through the agent's queue.
    pub async fn sync(&self) -> Result<Value, DispatchError> {
        self.dispatcher.send_command(LOCATOR, "sync", &[])?.await
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
