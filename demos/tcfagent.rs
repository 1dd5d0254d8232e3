// Copyright 2020 Joyent, Inc.

//! A stand-in TCF agent for trying out clients without hardware.

use std::env;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::sync::Mutex;

use serde_derive::Deserialize;
use serde_json::{json, Value};
use slog::{debug, error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use tcf_dispatch::protocol::{unstringify, Message, DEFAULT_MAX_FRAME_LENGTH};
use tcf_dispatch::server;

const SERVICES: &[&str] = &["Locator", "Diagnostics"];

#[derive(Deserialize)]
struct LoadPayload {
    steps: u64,
    #[serde(default)]
    label: Option<String>,
}

fn other_error(msg: &str) -> Error {
    Error::new(ErrorKind::Other, String::from(msg))
}

fn echo_handler(
    token: u64,
    args: &[Value],
    log: &Logger,
) -> Result<Vec<Message>, Error> {
    debug!(log, "handling echo command");
    let payload = args.first().cloned().unwrap_or(Value::Null);
    Ok(vec![Message::result(token, None, &payload)?])
}

fn load_handler(
    token: u64,
    args: &[Value],
    log: &Logger,
) -> Result<Vec<Message>, Error> {
    debug!(log, "handling load command");
    let payload: LoadPayload = match args.first() {
        Some(arg) => serde_json::from_value(arg.clone()).map_err(|_| {
            other_error("Failed to parse JSON data as payload for load command")
        })?,
        None => return Err(other_error("Expected one argument")),
    };

    let description = payload.label.unwrap_or_else(|| String::from("Loading"));
    let mut response = Vec::new();
    response.push(Message::flow_control(1));
    for step in 1..=payload.steps {
        response.push(Message::progress(
            token,
            &json!({
                "ProgressComplete": step,
                "ProgressTotal": payload.steps,
                "Description": description,
            }),
        )?);
    }
    response.push(Message::flow_control(0));
    response.push(Message::result(token, None, &json!(payload.steps))?);
    Ok(response)
}

fn command_handler(
    token: u64,
    service: &str,
    command: &str,
    args: &[Value],
    log: &Logger,
) -> Result<Vec<Message>, Error> {
    match (service, command) {
        ("Locator", "sync") => Ok(vec![Message::result(token, None, &Value::Null)?]),
        ("Diagnostics", "echo") => echo_handler(token, args, log),
        ("Diagnostics", "load") => load_handler(token, args, log),
        _ => {
            let report = json!({
                "Code": 1,
                "Format": format!("Unsupported command: {}.{}", service, command),
            });
            Ok(vec![Message::result(token, Some(&report), &Value::Null)?])
        }
    }
}

fn msg_handler(msg: &Message, log: &Logger) -> Result<Vec<Message>, Error> {
    match msg {
        Message::Command {
            token,
            service,
            command,
            args,
        } => {
            let args = unstringify(args)?;
            match command_handler(*token, service, command, &args, log) {
                Ok(response) => Ok(response),
                Err(e) => {
                    let report = json!({ "Code": 2, "Format": e.to_string() });
                    Ok(vec![Message::result(*token, Some(&report), &Value::Null)?])
                }
            }
        }
        Message::Event { service, name, .. }
            if service == "Locator" && name == "Hello" =>
        {
            info!(log, "client hello");
            Ok(vec![Message::event("Locator", "Hello", &[json!(SERVICES)])?])
        }
        other => {
            debug!(log, "ignoring message"; "kind" => other.kind());
            Ok(vec![])
        }
    }
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args().nth(1).unwrap_or("127.0.0.1:1534".to_string());
    let addr = addr.parse::<SocketAddr>().unwrap();

    let listener = TcpListener::bind(addr).await.expect("failed to bind");
    info!(root_log, "listening for TCF clients"; "address" => addr);

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                let process_log = root_log.clone();
                tokio::spawn(async move {
                    server::make_task(
                        socket,
                        msg_handler,
                        DEFAULT_MAX_FRAME_LENGTH,
                        Some(&process_log),
                    )
                    .await;
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
