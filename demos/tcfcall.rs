// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;
use std::time::Duration;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use serde_json::Value;
use slog::{o, Drain, Level, LevelFilter, Logger};

use tcf_dispatch::client;
use tcf_dispatch::config::{DispatcherConfig, DEFAULT_HOST, DEFAULT_PORT};
use tcf_dispatch::locator::Locator;

static APP: &'static str = "tcfcall";

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for sending one command to a TCF agent")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address of the agent")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port of the agent (Default: 1534)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("service")
                .help("Name of the remote service")
                .long("service")
                .short("s")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("command")
                .help("Name of the command")
                .long("command")
                .short("c")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON array of command arguments")
                .long("args")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Seconds to wait for the result")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log every frame")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let service = String::from(matches.value_of("service").unwrap_or_else(|| {
        eprintln!("Failed to parse service argument as String");
        process::exit(1)
    }));
    let command = String::from(matches.value_of("command").unwrap_or_else(|| {
        eprintln!("Failed to parse command argument as String");
        process::exit(1)
    }));
    let args = match matches.value_of("args") {
        Some(_) => value_t!(matches, "args", Value).unwrap_or_else(|e| e.exit()),
        None => Value::Array(vec![]),
    };
    let args = match args {
        Value::Array(args) => args,
        _ => {
            eprintln!("Command arguments must be a JSON array");
            process::exit(1)
        }
    };

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Info
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let mut config = DispatcherConfig::new(&host, port);
    if let Ok(secs) = value_t!(matches, "timeout", u64) {
        config = config.with_command_timeout(Duration::from_secs(secs));
    }

    let conn = client::connect(&config, Some(&log))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to connect to agent: {}", e);
            process::exit(1)
        });

    let locator = Locator::attach(conn.dispatcher());
    let ready = match locator.hello() {
        Ok(()) => locator.wait_for_hello().await,
        Err(e) => Err(e),
    };
    if let Err(e) = ready {
        eprintln!("Handshake failed: {}", e);
        process::exit(1)
    }

    let result = match conn.dispatcher().send_command(&service, &command, &args) {
        Ok(pending) => pending.await,
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => println!("{}", value),
        Err(e) => eprintln!("Error: {}", e),
    }

    conn.close();
    if let Err(e) = conn.closed().await {
        eprintln!("Error: {}", e);
    }
}
