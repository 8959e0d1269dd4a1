//! Consumer: drains per-room broker queues, broadcasts, persists.

pub mod bus_publisher;
pub mod db_writer;
pub mod worker;

pub use bus_publisher::{BusPublish, BusPublisher, BusSink, RedisBusSink};
pub use db_writer::{DbWriter, DbWriterConfig};
pub use worker::{process_delivery, AckBatcher, AckFlush, DeliveryOutcome, ACK_BATCH_SIZE};

use crate::config::ConsumerConfig;
use crate::fabric::declare_topology;
use crate::metrics::ConsumerCounters;
use crate::storage::MessageStore;
use crate::types::{ROOM_MAX, ROOM_MIN};
use lapin::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

/// Bound on waiting for workers to stop dequeuing and settle their batches.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

impl DbWriterConfig {
    pub fn from_consumer(config: &ConsumerConfig) -> Self {
        Self {
            batch_size: config.db_batch_size,
            flush_interval: Duration::from_millis(config.db_flush_interval_ms),
            writers: config.db_writer_threads,
            ..Default::default()
        }
    }
}

/// The running consumer: room workers, bus publisher, DB writer pool.
pub struct ConsumerService {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    bus_publisher: BusPublisher,
    db_writer: Option<DbWriter>,
}

impl ConsumerService {
    /// Declare topology and start every (room x replica) worker. Pass no
    /// store to run with persistence disabled: broadcasts still flow, the
    /// DB pipeline simply does not exist.
    pub async fn start<S: MessageStore>(
        broker: Arc<Connection>,
        bus_url: String,
        store: Option<Arc<S>>,
        config: &ConsumerConfig,
        counters: Arc<ConsumerCounters>,
    ) -> Result<Self, lapin::Error> {
        let channel = broker.create_channel().await?;
        declare_topology(&channel).await?;

        let bus_publisher = BusPublisher::spawn(bus_url, counters.clone());
        let db_writer = store.map(|store| {
            DbWriter::spawn(store, DbWriterConfig::from_consumer(config), counters.clone())
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        for room in ROOM_MIN..=ROOM_MAX {
            for replica in 0..config.consumers_per_room {
                workers.push(tokio::spawn(worker::worker_main(
                    broker.clone(),
                    room,
                    replica,
                    config.prefetch_count,
                    bus_publisher.sender(),
                    db_writer.as_ref().map(|w| w.sender()),
                    counters.clone(),
                    shutdown_rx.clone(),
                )));
            }
        }
        info!(
            "consumer started: {} workers ({} per room), persistence {}",
            workers.len(),
            config.consumers_per_room,
            if db_writer.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            shutdown_tx,
            workers,
            bus_publisher,
            db_writer,
        })
    }

    /// Ordered shutdown: stop dequeuing, settle ack batches, drain the bus
    /// publisher, then drain the DB writers inside their grace period.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + WORKER_SHUTDOWN_GRACE;
        for handle in self.workers {
            if timeout_at(deadline, handle).await.is_err() {
                warn!("a consumer worker did not stop within {:?}", WORKER_SHUTDOWN_GRACE);
                break;
            }
        }

        self.bus_publisher.shutdown().await;
        if let Some(writer) = self.db_writer {
            writer.shutdown().await;
        }
        info!("consumer stopped");
    }
}
