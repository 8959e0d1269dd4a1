//! Chatflow load generator.
//!
//! Closed-loop client: generates valid messages, sends them through the
//! pooled sockets, and reports latency and failure counts at the end.

use chatflow::client::{self, LoadClientConfig};
use clap::Parser;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "chatflow-loadgen", version, about = "Chatflow load generator")]
struct Args {
    /// Edge origin to target
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    target: String,

    /// Messages to send in total
    #[arg(short, long, default_value = "10000")]
    messages: u64,

    /// Sender workers
    #[arg(short, long, default_value = "16")]
    workers: usize,
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
    info!("Chatflow loadgen v{}", VERSION);
    info!(
        "{} messages via {} workers against {}",
        args.messages, args.workers, args.target
    );

    let snapshot = client::run(LoadClientConfig {
        target: args.target,
        messages: args.messages,
        workers: args.workers,
    })
    .await;

    info!(
        "acked {} | failed {} | retries {} | breaker rejections {} | generator drops {}",
        snapshot.acked,
        snapshot.failed,
        snapshot.retries,
        snapshot.breaker_rejections,
        snapshot.generator_drops
    );
    info!(
        "latency avg {} us | max {} us",
        snapshot.latency_avg_micros, snapshot.latency_max_micros
    );
    Ok(())
}
