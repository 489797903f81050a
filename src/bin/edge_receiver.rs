//! Edge receiver binary - runs close to the exchange, forwards normalized
//! depth/trade packets to the core engine over UDP.
//!
//! Kept as a separate process (and a separate binary crate target) from the
//! core engine so it can be deployed on a box with low-latency network
//! access to Binance while the core engine runs wherever the detector
//! pipeline needs to live (§5a).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowedge::edge::{EdgeReceiver, EdgeReceiverConfig};

#[derive(Parser, Debug)]
#[command(name = "edge_receiver")]
#[command(about = "flowedge edge receiver - forwards Binance depth/trade packets to the core engine")]
struct Args {
    /// Symbols to subscribe to (comma-separated).
    #[arg(long, env = "FLOWEDGE_EDGE_SYMBOLS", default_value = "BTCUSDT,LTCUSDT")]
    symbols: String,

    /// Binance WebSocket URL.
    #[arg(long, env = "FLOWEDGE_EDGE_BINANCE_WS_URL", default_value = "wss://stream.binance.com:9443/ws")]
    binance_ws_url: String,

    /// Destination address to forward normalized packets to.
    #[arg(long, env = "FLOWEDGE_EDGE_FORWARD_ADDR", default_value = "127.0.0.1:19876")]
    forward_addr: SocketAddr,

    /// Heartbeat interval in milliseconds.
    #[arg(long, env = "FLOWEDGE_EDGE_HEARTBEAT_MS", default_value = "100")]
    heartbeat_ms: u64,

    /// Stale threshold in milliseconds.
    #[arg(long, env = "FLOWEDGE_EDGE_STALE_MS", default_value = "100")]
    stale_ms: u64,

    /// CPU core to pin to (optional).
    #[arg(long, env = "FLOWEDGE_EDGE_PIN_CORE")]
    pin_core: Option<usize>,

    /// Max depth levels forwarded per side of a diff update.
    #[arg(long, env = "FLOWEDGE_EDGE_DEPTH_LEVELS", default_value = "20")]
    depth_levels: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = config_from_args(args);
    info!(
        symbols = ?config.symbols,
        forward_addr = %config.forward_addr,
        "edge_receiver starting"
    );

    let receiver = EdgeReceiver::new(config);
    receiver.run().await.context("edge receiver loop failed")
}

fn config_from_args(args: Args) -> EdgeReceiverConfig {
    EdgeReceiverConfig {
        symbols: args
            .symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        binance_ws_url: args.binance_ws_url,
        forward_addr: args.forward_addr,
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        stale_threshold: Duration::from_millis(args.stale_ms),
        pin_to_core: args.pin_core,
        depth_levels: args.depth_levels,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_receiver=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
