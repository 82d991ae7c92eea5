// Copyright 2020 Joyent, Inc.

use std::process;
use std::sync::Mutex;

use clap::{crate_version, value_t, App, Arg, ArgMatches};
use rmpv::Value;
use slog::{o, Drain, Logger};
use tokio::sync::oneshot;

use msgpack_rpc_client::{Response, RpcClient, RpcConfig};

static APP: &'static str = "rpccall";
static DEFAULT_HOST: &'static str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6666;

pub fn parse_opts<'a, 'b>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for making a msgpack RPC function call")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("DNS name or IP address for remote peer")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port for remote peer (Default: 6666)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("function")
                .help("Name of remote RPC function")
                .long("function")
                .short("f")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("args")
                .help("JSON-encoded array of arguments for the call")
                .long("args")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("verbose")
                .help("Log protocol traffic")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn print_response(rsp: &Response) {
    match &rsp.error {
        Some(err) => eprintln!("Error: {}", err),
        None => println!("{}", rsp.result),
    }
}

#[tokio::main]
async fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u16).unwrap_or(DEFAULT_PORT);
    let function =
        String::from(matches.value_of("function").unwrap_or_else(|| {
            eprintln!("Failed to parse function argument as String");
            process::exit(1)
        }));
    let args = matches.value_of("args").unwrap_or("[]");
    let params: Vec<Value> = serde_json::from_str(args).unwrap_or_else(|e| {
        eprintln!("Failed to parse args as a JSON array: {}", e);
        process::exit(1)
    });

    let level = if matches.is_present("verbose") {
        slog::Level::Debug
    } else {
        slog::Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(slog::LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let mut client = RpcClient::new(RpcConfig::default(), Some(&log));
    client.connect(&host, port).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to peer: {}", e);
        process::exit(1)
    });

    let (tx, rx) = oneshot::channel();
    let msg = client.request(function, params);
    let sent = client
        .send(
            msg,
            Some(Box::new(move |rsp: Response| {
                let _ = tx.send(rsp);
            })),
        )
        .await;

    if let Err(e) = sent {
        eprintln!("Error: {}", e);
        process::exit(1)
    }

    let result = tokio::select! {
        rsp = rx => rsp.map_err(|_| "response callback dropped"),
        _ = client.listen() => Err("connection closed before a response"),
    };

    match result {
        Ok(rsp) => print_response(&rsp),
        Err(e) => eprintln!("Error: {}", e),
    }

    let _ = client.disconnect();
}
