//! Chatflow consumer.
//!
//! Drains the per-room broker queues, broadcasts over the bus, and
//! persists through the batched DB writer.

use anyhow::Context;
use chatflow::config::{BrokerConfig, BusConfig, ConsumerConfig, DbConfig};
use chatflow::consumer::ConsumerService;
use chatflow::fabric::connect_broker;
use chatflow::metrics::ConsumerCounters;
use chatflow::storage::Storage;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Re-check partitions daily so month rollovers never race the writers.
const PARTITION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser)]
#[command(name = "chatflow-consumer", version, about = "Chatflow queue consumer")]
struct Args {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatflow=info".parse().unwrap()),
        )
        .init();

    let _args = Args::parse();
    let broker_config = BrokerConfig::from_env().context("broker configuration")?;
    let bus_config = BusConfig::from_env().context("bus configuration")?;
    let db_config = DbConfig::from_env();
    let consumer_config = ConsumerConfig::from_env();

    info!("Chatflow consumer v{}", VERSION);
    info!(
        "{} workers per room | prefetch {} | batch {} rows / {} ms | persistence {}",
        consumer_config.consumers_per_room,
        consumer_config.prefetch_count,
        consumer_config.db_batch_size,
        consumer_config.db_flush_interval_ms,
        consumer_config.enable_persistence,
    );

    let broker = Arc::new(
        connect_broker(&broker_config)
            .await
            .context("broker connection")?,
    );

    let store: Option<Arc<Storage>> = if consumer_config.enable_persistence {
        let storage = Storage::connect(&db_config).await.context("storage connection")?;
        storage.init_schema().await.context("schema bootstrap")?;
        Some(Arc::new(storage))
    } else {
        info!("persistence disabled, skipping DB writer");
        None
    };

    let partition_task = store.clone().map(|storage| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PARTITION_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = storage.ensure_partitions().await {
                    warn!("partition check failed: {}", e);
                }
            }
        })
    });

    let counters = Arc::new(ConsumerCounters::default());
    let service = ConsumerService::start(
        broker.clone(),
        bus_config.redis_url(),
        store.clone(),
        &consumer_config,
        counters.clone(),
    )
    .await
    .context("consumer startup")?;

    let status_counters = counters.clone();
    let status = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            interval.tick().await;
            let s = status_counters.snapshot();
            info!(
                "status: {} processed | {} acked | {} nacked | {} bus published | {} db written | {} db dropped",
                s.processed, s.acked, s.nacked, s.bus_published, s.db_written, s.db_dropped,
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    status.abort();
    if let Some(task) = partition_task {
        task.abort();
    }
    service.shutdown().await;

    if let Some(storage) = store {
        if let Ok(storage) = Arc::try_unwrap(storage) {
            storage.close().await;
        }
    }
    info!("Consumer stopped");
    Ok(())
}
