//! electrumrpc CLI — query Electrum servers from the terminal.
//!
//! Usage:
//! ```bash
//! # Chain tip and round-trip latency
//! electrumrpc tip --url wss://electrum.blockstream.info:50004
//!
//! # Send a raw JSON-RPC call
//! electrumrpc call --url wss://... --method blockchain.estimatefee --params '[6]'
//!
//! # Follow new block headers
//! electrumrpc headers --url wss://... --count 3
//! ```

use std::env;
use std::process;
use std::time::Duration;

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use electrumrpc_ws::{ClientConfig, ElectrumClient, TransportConfig};

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "tip" => cmd_tip(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "headers" => cmd_headers(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("electrumrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `warn` so command output stays clean).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    println!("electrumrpc {}", env!("CARGO_PKG_VERSION"));
    println!("Query Electrum servers over WebSocket\n");
    println!("USAGE:");
    println!("    electrumrpc <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    tip        Print the chain tip and server version");
    println!("    call       Send a raw JSON-RPC call");
    println!("    headers    Follow new block headers");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>          Server URL (ws:// or wss://)  [required]");
    println!("    --method <METHOD>    Method path (call)             [required for call]");
    println!("    --params <JSON>      Params array or object (call)  [default: []]");
    println!("    --count <N>          Headers to wait for (headers)  [default: 1]");
    println!("    --timeout <SECS>     Per-call timeout               [default: 30]");
}

async fn connect(args: &[String]) -> Result<ElectrumClient, String> {
    let url = parse_flag(args, "--url").ok_or("--url is required")?;
    let mut config = ClientConfig::default();
    if let Some(secs) = parse_flag(args, "--timeout") {
        let secs: u64 = secs
            .parse()
            .map_err(|_| format!("invalid --timeout: {secs}"))?;
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    let client = ElectrumClient::connect_ws(&url, TransportConfig::default(), config)
        .await
        .map_err(|e| e.to_string())?;
    tracing::debug!(url = %url, "connected");
    Ok(client)
}

async fn cmd_tip(args: &[String]) -> Result<(), String> {
    let client = connect(args).await?;

    let start = std::time::Instant::now();
    let version = client.server_version().await.map_err(|e| e.to_string())?;
    let tip = client.block_tip().await.map_err(|e| e.to_string())?;
    let latency = start.elapsed();

    println!("  Server:   {} (protocol {})", version.software, version.protocol);
    println!("  Height:   {}", tip.height);
    println!("  Header:   {} bytes", tip.header.len());
    println!("  Latency:  {}ms", latency.as_millis());

    client.shutdown().await;
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<(), String> {
    let method = parse_flag(args, "--method").ok_or("--method is required")?;
    let params: Value = match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid --params: {e}"))?,
        None => Value::Array(vec![]),
    };

    let client = connect(args).await?;
    let result: Option<Value> = client
        .call_optional(&method, params)
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result.unwrap_or(Value::Null)).unwrap_or_default()
    );
    client.shutdown().await;
    Ok(())
}

async fn cmd_headers(args: &[String]) -> Result<(), String> {
    let count: usize = match parse_flag(args, "--count") {
        Some(n) => n.parse().map_err(|_| format!("invalid --count: {n}"))?,
        None => 1,
    };

    let client = connect(args).await?;
    let (tip, mut subscription) = client.subscribe_headers().await.map_err(|e| e.to_string())?;
    println!("  Current:  {}", tip.height);

    for _ in 0..count {
        match subscription.next_notification().await {
            Some(Ok(notification)) => println!("  New:      {notification:?}"),
            Some(Err(e)) => return Err(e.to_string()),
            None => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
