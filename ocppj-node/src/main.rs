//! OCPP-J networking node CLI
//!
//! Runs one node: accepts peers, keeps a link to an upstream node and
//! relays frames between them.
//!
//! # Usage
//!
//! ```bash
//! # Relay between stations and a central system
//! ocppj-node --id R1 --listen 0.0.0.0:9000 --upstream ws://csms:9000/ocpp
//!
//! # Central system endpoint, CS001 speaks plain OCPP-J
//! ocppj-node --id CSMS --listen 0.0.0.0:9000 --plain CS001
//! ```

use std::net::SocketAddr;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use ocppj_core::{ws, Direction, HandlerError, NetworkingNode, NodeConfig};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// OCPP-J networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long)]
    id: String,

    /// Address to accept peer connections on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Upstream WebSocket URL (node id is appended)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Node id of the upstream peer
    #[arg(long, default_value = "CSMS")]
    upstream_id: String,

    /// Maximum network path length
    #[arg(long, default_value = "8")]
    max_hops: usize,

    /// Maximum frame size in bytes
    #[arg(long, default_value = "65536")]
    max_frame_size: usize,

    /// Outbound queue capacity per session
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Peers speaking plain OCPP-J (can be repeated)
    #[arg(long)]
    plain: Vec<String>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 OCPP-J Networking Node                       ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.id);
    println!("║  Listen:   {:<50} ║", display_opt(args.listen.map(|a| a.to_string())));
    println!("║  Upstream: {:<50} ║", truncate(&display_opt(args.upstream.clone()), 50));
    println!("║  Max hops: {:<50} ║", args.max_hops);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = NodeConfig::new(args.id.as_str())
        .with_max_hops(args.max_hops)
        .with_max_frame_size(args.max_frame_size)
        .with_queue_capacity(args.queue_capacity);
    for peer in &args.plain {
        config = config.with_plain_peer(peer.as_str());
        info!("Plain OCPP-J peer: {}", peer);
    }
    if let Some(addr) = args.listen {
        config = config.with_listen_addr(addr);
    }
    if let Some(url) = &args.upstream {
        config = config.with_upstream(url.as_str(), args.upstream_id.as_str());
    }

    let node = NetworkingNode::new(config.clone());

    node.register_typed("Heartbeat", |_: serde_json::Value| async {
        Ok::<_, HandlerError>(json!({
            "currentTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        }))
    });

    node.on_frame_observed(|observation| {
        let arrow = match observation.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        debug!(
            "{} {} {:?} {}",
            arrow,
            observation.node,
            observation.frame.message_type(),
            observation.frame.message_id()
        );
    });

    let upstream = ws::spawn_upstream(node.clone(), config.ws.clone());

    info!("Starting OCPP-J node {}...", node.id());
    match config.ws.listen_addr {
        Some(addr) => {
            tokio::select! {
                result = ws::listen(node.clone(), addr, config.ws.subprotocols.clone()) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }

    if let Some(upstream) = upstream {
        upstream.abort();
    }
    node.shutdown();
    Ok(())
}

fn display_opt(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

/// Truncate string with ellipsis, counting characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
