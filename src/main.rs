//! Chatflow edge server.
//!
//! Accepts client sockets at `/chat/{roomId}`, validates and publishes to
//! the queue fabric, and fans bus broadcasts out to local members.

use anyhow::Context;
use chatflow::config::{BrokerConfig, BusConfig};
use chatflow::edge::{router, BusBridge, EdgeApp, RoomMembership};
use chatflow::fabric::{connect_broker, declare_topology, BrokerIngress};
use chatflow::metrics::EdgeCounters;
use clap::Parser;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on closing the open sockets during shutdown.
const SOCKET_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "chatflow-edge", version, about = "Chatflow edge server")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatflow=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let broker_config = BrokerConfig::from_env().context("broker configuration")?;
    let bus_config = BusConfig::from_env().context("bus configuration")?;

    info!("Chatflow edge v{}", VERSION);
    info!("Listening on {}", args.listen);

    let broker = Arc::new(
        connect_broker(&broker_config)
            .await
            .context("broker connection")?,
    );
    let channel = broker.create_channel().await.context("broker channel")?;
    declare_topology(&channel).await.context("topology declaration")?;

    let membership = Arc::new(RoomMembership::new());
    let counters = Arc::new(EdgeCounters::default());
    let bridge = BusBridge::spawn(bus_config.redis_url(), membership.clone(), counters.clone());

    let app = Arc::new(EdgeApp::new(
        membership.clone(),
        BrokerIngress::new(broker.clone()),
        counters.clone(),
    ));

    let status_counters = counters.clone();
    let status = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;
            let s = status_counters.snapshot();
            info!(
                "status: {} conns | {} accepted | {}/{}/{} parse/validation/queue errors | {} broadcasts ({} failed)",
                s.open_connections,
                s.accepted,
                s.parse_errors,
                s.validation_errors,
                s.queue_errors,
                s.broadcasts_delivered,
                s.broadcasts_failed,
            );
        }
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .context("bind listen address")?;

    tokio::select! {
        result = axum::serve(listener, router(app)).into_future() => {
            result.context("edge server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    // Accepting has stopped; close the existing sockets, then stop the bus
    // subscriber, then let the broker connection drop.
    status.abort();
    membership.close_all(SOCKET_CLOSE_GRACE).await;
    bridge.shutdown().await;
    info!("Edge stopped");
    Ok(())
}
