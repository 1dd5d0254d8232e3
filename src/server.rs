// Copyright 2020 Joyent, Inc.

//! The agent side of a connection: decode inbound frames, let a handler
//! produce response frames, write them back.

use std::io::Error;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::protocol::{escape_for_log, Message, TcfCodec};

/// Serve one connection. Inbound frames longer than `max_frame_length` end
/// it.
pub async fn make_task<T, F>(
    socket: T,
    response_handler: F,
    max_frame_length: usize,
    log: Option<&Logger>,
) where
    T: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&Message, &Logger) -> Result<Vec<Message>, Error> + Send + Sync,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let (mut tx, mut rx) = Framed::new(socket, TcfCodec::new(max_frame_length)).split();

    while let Some(frame) = rx.next().await {
        let responses = frame
            .map_err(Error::from)
            .and_then(|text| respond(&text, &response_handler, &log));

        let responses = match responses {
            Ok(responses) => responses,
            Err(e) => {
                error!(log, "failed to process connection"; "err" => %e);
                break;
            }
        };

        for msg in responses {
            let text = msg.encode();
            debug!(log, ">> {}", escape_for_log(&text));
            if let Err(e) = tx.feed(text).await {
                error!(log, "failed to send response"; "err" => %e);
                return;
            }
        }
        if let Err(e) = tx.flush().await {
            error!(log, "failed to send response"; "err" => %e);
            return;
        }
    }

    debug!(log, "connection finished");
}

fn respond<F>(text: &str, response_handler: &F, log: &Logger) -> Result<Vec<Message>, Error>
where
    F: Fn(&Message, &Logger) -> Result<Vec<Message>, Error>,
{
    debug!(log, "<< {}", escape_for_log(text));
    let msg = Message::parse(text).map_err(Error::from)?;
    response_handler(&msg, log)
}
