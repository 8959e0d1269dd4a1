//! Batched, bounded persistence pipeline.
//!
//! Consumer workers offer into one bounded queue; W writer tasks drain it,
//! accumulating until the batch fills or the flush interval elapses, then
//! execute one batch insert. A failed batch is lost and counted: the broker
//! already acked those deliveries, so retrying here could only double-write
//! what the idempotent key would reject anyway.
//!
//! Shutdown closes the intake, lets the writers drain the queue, and gives
//! every writer a final short-batch flush inside the grace period.

use crate::metrics::ConsumerCounters;
use crate::storage::MessageStore;
use crate::types::QueuedMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Batches slower than this are logged.
const SLOW_BATCH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DbWriterConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub writers: usize,
    pub shutdown_grace: Duration,
}

impl Default for DbWriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50_000,
            batch_size: 1_000,
            flush_interval: Duration::from_millis(500),
            writers: 4,
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// Handle to the writer pool.
pub struct DbWriter {
    tx: mpsc::Sender<QueuedMessage>,
    handles: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl DbWriter {
    pub fn spawn<S: MessageStore>(
        store: Arc<S>,
        config: DbWriterConfig,
        counters: Arc<ConsumerCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..config.writers.max(1))
            .map(|id| {
                tokio::spawn(writer_loop(
                    id,
                    rx.clone(),
                    store.clone(),
                    config.clone(),
                    counters.clone(),
                ))
            })
            .collect();
        Self {
            tx,
            handles,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Offer sender for consumer workers.
    pub fn sender(&self) -> mpsc::Sender<QueuedMessage> {
        self.tx.clone()
    }

    /// Stop accepting offers, drain the queue, final-flush every writer.
    /// Bounded by the configured grace period.
    pub async fn shutdown(self) {
        drop(self.tx);
        let deadline = Instant::now() + self.shutdown_grace;
        for handle in self.handles {
            if timeout_at(deadline, handle).await.is_err() {
                warn!("db writer did not drain within the grace period");
                return;
            }
        }
        info!("db writers drained");
    }
}

async fn writer_loop<S: MessageStore>(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<QueuedMessage>>>,
    store: Arc<S>,
    config: DbWriterConfig,
    counters: Arc<ConsumerCounters>,
) {
    let mut batch: Vec<QueuedMessage> = Vec::with_capacity(config.batch_size);
    loop {
        // Block for the first row; the interval clock starts here, not at
        // an empty batch, so an idle writer never spins.
        let first = { rx.lock().await.recv().await };
        let Some(first) = first else { break };
        batch.push(first);

        let deadline = Instant::now() + config.flush_interval;
        let mut closed = false;
        while batch.len() < config.batch_size {
            let next = {
                let mut guard = rx.lock().await;
                match timeout_at(deadline, guard.recv()).await {
                    Ok(Some(m)) => Some(m),
                    Ok(None) => {
                        closed = true;
                        None
                    }
                    Err(_) => None,
                }
            };
            match next {
                Some(m) => batch.push(m),
                None => break,
            }
        }

        flush_batch(id, store.as_ref(), &mut batch, &counters).await;
        if closed {
            break;
        }
    }
    debug!("db writer {} stopped", id);
}

async fn flush_batch<S: MessageStore>(
    id: usize,
    store: &S,
    batch: &mut Vec<QueuedMessage>,
    counters: &ConsumerCounters,
) {
    if batch.is_empty() {
        return;
    }
    let started = Instant::now();
    match store.insert_batch(batch).await {
        Ok(rows) => {
            counters
                .db_written
                .fetch_add(rows, std::sync::atomic::Ordering::Relaxed);
        }
        Err(e) => {
            error!("db writer {}: batch of {} lost: {}", id, batch.len(), e);
            counters
                .db_batches_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
    let elapsed = started.elapsed();
    if elapsed > SLOW_BATCH {
        warn!(
            "db writer {}: slow batch, {} rows in {:?}",
            id,
            batch.len(),
            elapsed
        );
    }
    batch.clear();
}
