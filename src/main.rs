//! flowedge core engine binary.
//!
//! Loads `EngineConfig` from the environment, starts the Prometheus scrape
//! endpoint, connects to the edge receiver client over UDP, and spawns one
//! [`engine::CoreLoop`] per tracked symbol. Blocks on Ctrl-C, then drains
//! every core loop before exiting.

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowedge::edge::{EdgeFallbackController, EdgeReceiverClient, EdgeReceiverClientConfig};
use flowedge::engine;
use flowedge::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "flowedge")]
#[command(about = "flowedge real-time order-flow analytics core engine")]
struct Args {
    /// Enable the Prometheus metrics exporter.
    #[arg(long, env = "FLOWEDGE_METRICS_ENABLED", default_value = "true")]
    metrics_enabled: bool,

    /// Address the Prometheus metrics exporter listens on.
    #[arg(long, env = "FLOWEDGE_METRICS_ADDR", default_value = "0.0.0.0:9898")]
    metrics_addr: std::net::SocketAddr,

    /// Base CPU core to pin each symbol's core loop to (symbol index is
    /// added to this); omit to run unpinned.
    #[arg(long, env = "FLOWEDGE_PIN_BASE_CORE")]
    pin_base_core: Option<usize>,

    /// Local address the edge receiver client binds to for inbound UDP
    /// packets from the edge receiver binary.
    #[arg(long, env = "FLOWEDGE_EDGE_CLIENT_BIND_ADDR", default_value = "0.0.0.0:19876")]
    edge_client_bind_addr: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = EngineConfig::from_env().context("invalid FLOWEDGE_* configuration")?;
    info!(symbol = %config.symbol, tick_size = config.tick_size, "flowedge starting");

    if args.metrics_enabled {
        engine::maybe_install_metrics(Some(args.metrics_addr))
            .context("failed to install metrics exporter")?;
    }

    let symbols: Vec<String> = config
        .symbol
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let (mut handles, channels_by_symbol) =
        engine::spawn_core_loops(&symbols, &config, args.pin_base_core);
    info!(symbols = ?symbols, "core loops running");

    let client_config = EdgeReceiverClientConfig {
        bind_addr: args.edge_client_bind_addr,
        ..Default::default()
    };
    let client = EdgeReceiverClient::new(client_config);
    engine::connect_client(client.clone(), channels_by_symbol)
        .context("failed to start edge receiver client")?;

    let fallback = EdgeFallbackController::new(client.clone());

    let mut health_ticker = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining core loops");
                break;
            }
            _ = health_ticker.tick() => {
                if fallback.should_fallback() {
                    warn!("edge client stale; upstream depth/trade feed may be down");
                }
            }
        }
    }

    for handle in &mut handles {
        handle.shutdown();
    }
    client.stop();

    info!("flowedge stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowedge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
