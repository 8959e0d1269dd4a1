//! Batched bus publisher.
//!
//! Workers never touch the bus connection directly: they hand publishes to
//! one bounded queue drained by a single task that pipelines batches over
//! one long-lived connection. The publisher never drops: a failed batch is
//! retried against a fresh connection until it lands, so back-pressure
//! reaches the workers through the bounded queue instead of losing
//! broadcasts.

use crate::metrics::ConsumerCounters;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Hand-off queue depth between workers and the publisher.
const HANDOFF_CAPACITY: usize = 10_000;

/// Publishes pipelined per batch.
const MAX_BATCH: usize = 100;

/// Quiet period that flushes a short batch.
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Pause before retrying a failed batch on a new connection.
const RETRY_DELAY: Duration = Duration::from_millis(100);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One bus publish: channel name plus the serialized BroadcastMessage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPublish {
    pub channel: String,
    pub payload: String,
}

/// Sink seam so the batching loop can run against a stub in tests. The only
/// production implementation is [`RedisBusSink`].
pub trait BusSink: Send + 'static {
    fn publish_batch(
        &mut self,
        batch: &[BusPublish],
    ) -> impl Future<Output = Result<(), redis::RedisError>> + Send;
}

/// One long-lived multiplexed connection, re-dialed after any batch error.
pub struct RedisBusSink {
    url: String,
    conn: Option<redis::aio::MultiplexedConnection>,
}

impl RedisBusSink {
    pub fn new(url: String) -> Self {
        Self { url, conn: None }
    }
}

impl BusSink for RedisBusSink {
    async fn publish_batch(&mut self, batch: &[BusPublish]) -> Result<(), redis::RedisError> {
        if self.conn.is_none() {
            let client = redis::Client::open(self.url.as_str())?;
            self.conn = Some(client.get_multiplexed_async_connection().await?);
        }
        let conn = self.conn.as_mut().expect("connection just established");

        let mut pipe = redis::pipe();
        for item in batch {
            pipe.publish(&item.channel, &item.payload).ignore();
        }
        if let Err(e) = pipe.query_async::<()>(conn).await {
            self.conn = None;
            return Err(e);
        }
        Ok(())
    }
}

/// Handle to the running publisher task.
pub struct BusPublisher {
    tx: mpsc::Sender<BusPublish>,
    handle: JoinHandle<()>,
}

impl BusPublisher {
    pub fn spawn(redis_url: String, counters: Arc<ConsumerCounters>) -> Self {
        Self::spawn_with_sink(RedisBusSink::new(redis_url), counters)
    }

    pub fn spawn_with_sink<S: BusSink>(sink: S, counters: Arc<ConsumerCounters>) -> Self {
        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        let handle = tokio::spawn(run(sink, rx, counters));
        Self { tx, handle }
    }

    /// Hand-off sender for workers.
    pub fn sender(&self) -> mpsc::Sender<BusPublish> {
        self.tx.clone()
    }

    /// Close intake and wait for the queue to drain. Workers must already
    /// have dropped their senders or the drain cannot complete.
    pub async fn shutdown(self) {
        drop(self.tx);
        match timeout(SHUTDOWN_GRACE, self.handle).await {
            Ok(_) => info!("bus publisher drained"),
            Err(_) => warn!("bus publisher did not drain within {:?}", SHUTDOWN_GRACE),
        }
    }
}

async fn run<S: BusSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<BusPublish>,
    counters: Arc<ConsumerCounters>,
) {
    let mut batch: Vec<BusPublish> = Vec::with_capacity(MAX_BATCH);
    loop {
        // Block for the first publish of the next batch.
        let Some(first) = rx.recv().await else { break };
        batch.push(first);

        // Fill until the batch is full or the queue goes quiet.
        let mut closed = false;
        while batch.len() < MAX_BATCH {
            match timeout(POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        flush(&mut sink, &mut batch, &counters).await;
        if closed {
            return;
        }
    }
}

/// Publish one batch, retrying forever. Nothing in the batch is dropped.
async fn flush<S: BusSink>(
    sink: &mut S,
    batch: &mut Vec<BusPublish>,
    counters: &ConsumerCounters,
) {
    if batch.is_empty() {
        return;
    }
    loop {
        match sink.publish_batch(batch).await {
            Ok(()) => {
                counters
                    .bus_published
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                batch.clear();
                return;
            }
            Err(e) => {
                warn!("bus batch of {} failed, retrying: {}", batch.len(), e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
