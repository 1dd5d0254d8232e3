// Copyright 2020 Joyent, Inc.

use std::io::{Error, ErrorKind};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use slog::{error, info, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::protocol::TcfCodec;

/// An open connection to a TCF agent. All inbound frames are handled by a
/// single task, one at a time.
pub struct Connection {
    dispatcher: Dispatcher,
    shutdown: Arc<Notify>,
    task: JoinHandle<Result<(), DispatchError>>,
}

impl Connection {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Ask the connection task to flush queued frames and stop.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Wait for the connection task to finish. A framing or transport
    /// failure is reported here.
    pub async fn closed(self) -> Result<(), DispatchError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DispatchError::Io(Error::new(ErrorKind::Other, e))),
        }
    }
}

/// Connect to the agent named by `config`. The returned future resolves
/// once the transport is open; nothing is transmitted before then.
pub async fn connect(
    config: &DispatcherConfig,
    log: Option<&Logger>,
) -> Result<Connection, DispatchError> {
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

    info!(log, "connecting to TCF agent";
        "host" => &config.host, "port" => config.port);
    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            error!(log, "connect failed"; "err" => %e);
            e
        })?;
    let peer = stream.peer_addr()?;
    info!(log, "connection open"; "peer" => %peer);

    Ok(attach(stream, config, Some(&log)))
}

/// Like [`connect`], but hands the dispatcher to `on_ready` once the
/// transport is open.
pub async fn connect_with<F>(
    config: &DispatcherConfig,
    log: Option<&Logger>,
    on_ready: F,
) -> Result<Connection, DispatchError>
where
    F: FnOnce(&Dispatcher),
{
    let connection = connect(config, log).await?;
    on_ready(connection.dispatcher());
    Ok(connection)
}

/// Run a dispatcher over an already open byte stream. Must be called from
/// within a Tokio runtime.
pub fn attach<T>(
    io: T,
    config: &DispatcherConfig,
    log: Option<&Logger>,
) -> Connection
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(tx, config, Some(&log));
    let shutdown = Arc::new(Notify::new());
    let framed = Framed::new(io, TcfCodec::new(config.max_frame_length));

    let task = tokio::spawn(run(
        framed,
        rx,
        dispatcher.clone(),
        Arc::clone(&shutdown),
        log,
    ));

    Connection {
        dispatcher,
        shutdown,
        task,
    }
}

async fn run<T>(
    framed: Framed<T, TcfCodec>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    dispatcher: Dispatcher,
    shutdown: Arc<Notify>,
    log: Logger,
) -> Result<(), DispatchError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split();

    let result = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        error!(log, "transport error on send"; "err" => %e);
                        break Err(DispatchError::from(e));
                    }
                }
                None => break Ok(()),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => {
                    if let Err(e) = dispatcher.handle_message(&frame) {
                        error!(log, "closing connection on framing error";
                            "err" => %e);
                        break Err(e);
                    }
                }
                Some(Err(e)) => {
                    error!(log, "transport error on receive"; "err" => %e);
                    break Err(DispatchError::from(e));
                }
                None => {
                    info!(log, "connection closed by peer");
                    break Ok(());
                }
            },
            _ = shutdown.notified() => {
                info!(log, "closing connection");
                dispatcher.close();
                while let Ok(frame) = outbound.try_recv() {
                    if let Err(e) = sink.feed(frame).await {
                        error!(log, "transport error on flush"; "err" => %e);
                        break;
                    }
                }
                break Ok(());
            }
        }
    };

    dispatcher.close();
    if let Err(e) = sink.close().await {
        info!(log, "error closing transport"; "err" => %e);
    }

    result
}
