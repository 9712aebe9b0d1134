//! Simple broker with in-memory collaborators
//!
//! Run with: cargo run --example simple_broker [BIND_ADDR]
//!
//! Examples:
//!   cargo run --example simple_broker                    # binds to 0.0.0.0:8091
//!   cargo run --example simple_broker localhost          # binds to 127.0.0.1:8091
//!   cargo run --example simple_broker 127.0.0.1:9000     # binds to 127.0.0.1:9000
//!
//! Connect with any websocket client, e.g. websocat:
//!   websocat 'ws://localhost:8091/api/v1/ws?controlLayerVersion=2&messageLayerVersion=32'
//!
//! and send:
//!   {"type":"SubscribeRequest","requestId":"1","streamId":"demo/clock","streamPartition":0}
//!   {"type":"ResendLastRequest","requestId":"2","streamId":"demo/clock","streamPartition":0,"numberLast":5}
//!
//! A ticker publishes one message per second to `demo/clock` and keeps the
//! last messages in memory for resends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pubsub_broker::network::{LocalNetworkNode, NetworkNode};
use pubsub_broker::protocol::StreamMessage;
use pubsub_broker::resend::InMemoryHistory;
use pubsub_broker::{BrokerServer, Collaborators, ServerConfig};

const DEFAULT_PORT: u16 = 8091;
const CLOCK_STREAM: &str = "demo/clock";

fn parse_bind_addr(arg: &str) -> Result<SocketAddr, String> {
    let normalized = arg.replace("localhost", "127.0.0.1");

    if let Ok(addr) = normalized.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = normalized.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    Err(format!(
        "Invalid bind address: '{}'. Expected format: IP:PORT or IP or 'localhost'",
        arg
    ))
}

fn print_usage() {
    eprintln!("Usage: simple_broker [BIND_ADDR]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  BIND_ADDR    Address to bind to (default: 0.0.0.0:8091)");
}

fn clock_message(sequence_number: i64) -> StreamMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();

    StreamMessage {
        stream_id: CLOCK_STREAM.to_string(),
        stream_partition: 0,
        timestamp,
        sequence_number,
        publisher_id: "simple_broker".to_string(),
        msg_chain_id: "clock".to_string(),
        content: serde_json::json!({ "tick": sequence_number }),
        signature: None,
    }
}

async fn run_clock(network: Arc<LocalNetworkNode>, history: Arc<InMemoryHistory>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut sequence_number = 0;

    loop {
        interval.tick().await;

        let message = clock_message(sequence_number);
        history.store(message.clone());
        if let Err(e) = network.publish(message).await {
            tracing::warn!(error = %e, "Clock publish failed");
        }
        sequence_number += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let bind_addr = match args.get(1) {
        Some(addr_str) => match parse_bind_addr(addr_str) {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        },
        None => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pubsub_broker=debug".parse()?)
                .add_directive("simple_broker=debug".parse()?),
        )
        .init();

    let network = Arc::new(LocalNetworkNode::new());
    let history = Arc::new(InMemoryHistory::new());
    let collaborators = Collaborators::permissive(network.clone(), history.clone());

    let config = ServerConfig::with_addr(bind_addr);
    println!(
        "Starting broker on ws://{}{}?controlLayerVersion=2&messageLayerVersion=32",
        config.bind_addr, config.ws_path
    );

    let server = BrokerServer::new(config, collaborators);
    let clock = tokio::spawn(run_clock(network, history));

    let result = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await;

    clock.abort();

    let stats = server.stats();
    println!(
        "Served {} connection(s), {} frame(s), {} byte(s)",
        stats.total_connections, stats.out_messages, stats.out_bytes
    );

    if let Err(e) = result {
        eprintln!("Server error: {}", e);
    }

    Ok(())
}
