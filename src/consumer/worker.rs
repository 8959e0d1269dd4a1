//! Per-room broker worker.
//!
//! Each worker owns one channel pinned to its room queue and runs the
//! 3-step pipeline per delivery: broadcast hand-off, DB offer, batched ack.
//! A delivery is acked only after its broadcast hand-off succeeded; the DB
//! offer is best-effort after that point and a full queue is a counted
//! drop, never a failure.

use crate::consumer::bus_publisher::BusPublish;
use crate::fabric::topology::queue_name;
use crate::metrics::ConsumerCounters;
use crate::types::{bus_channel, BroadcastMessage, QueuedMessage, RoomId};
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Connection;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Deliveries acked per multi-ack.
pub const ACK_BATCH_SIZE: u64 = 100;

/// Bounded wait when handing to the bus publisher; elapsing means the bus
/// is backed up through an outage and the delivery is nacked instead of
/// stalling the worker.
const BUS_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Bounded wait when offering to the DB queue; elapsing surfaces as a drop.
const DB_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay before a faulted worker re-creates its channel and consumer.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// ACK BATCHING
// =============================================================================

/// A multi-ack that is due: everything up to `up_to` covering `count`
/// deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFlush {
    pub up_to: u64,
    pub count: u64,
}

/// Tracks delivery tags and decides when a multi-ack is due.
///
/// A NACK must not be covered by a later multi-ack, so the caller flushes
/// the batcher immediately before nacking; after the flush the batcher is
/// empty and the nack stands alone.
#[derive(Debug)]
pub struct AckBatcher {
    batch_size: u64,
    pending: u64,
    highest_tag: u64,
}

impl AckBatcher {
    pub fn new(batch_size: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pending: 0,
            highest_tag: 0,
        }
    }

    /// Record a successfully processed delivery. Returns the due multi-ack
    /// when the batch fills.
    pub fn track(&mut self, tag: u64) -> Option<AckFlush> {
        self.pending += 1;
        self.highest_tag = self.highest_tag.max(tag);
        if self.pending >= self.batch_size {
            return self.flush();
        }
        None
    }

    /// Drain the batch unconditionally (before a nack, on cancellation).
    pub fn flush(&mut self) -> Option<AckFlush> {
        if self.pending == 0 {
            return None;
        }
        let flush = AckFlush {
            up_to: self.highest_tag,
            count: self.pending,
        };
        self.pending = 0;
        Some(flush)
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }
}

// =============================================================================
// DELIVERY PIPELINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    /// Terminal for this delivery: requeue=false, broker dead-letters it.
    Nack,
}

/// Run steps 1-3 of the pipeline for one delivery payload.
pub async fn process_delivery(
    payload: &[u8],
    bus_tx: &mpsc::Sender<BusPublish>,
    db_tx: Option<&mpsc::Sender<QueuedMessage>>,
    counters: &ConsumerCounters,
) -> DeliveryOutcome {
    let queued: QueuedMessage = match serde_json::from_slice(payload) {
        Ok(queued) => queued,
        Err(e) => {
            warn!("undecodable delivery, dead-lettering: {}", e);
            return DeliveryOutcome::Nack;
        }
    };

    let broadcast = BroadcastMessage::from_queued(&queued);
    let publish = BusPublish {
        channel: bus_channel(queued.room_id),
        payload: match serde_json::to_string(&broadcast) {
            Ok(json) => json,
            Err(e) => {
                warn!("broadcast serialization failed, dead-lettering: {}", e);
                return DeliveryOutcome::Nack;
            }
        },
    };
    match timeout(BUS_OFFER_TIMEOUT, bus_tx.send(publish)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            warn!("bus publisher gone, nacking delivery for room {}", queued.room_id);
            return DeliveryOutcome::Nack;
        }
        Err(_) => {
            warn!(
                "bus hand-off queue full, nacking delivery for room {}",
                queued.room_id
            );
            return DeliveryOutcome::Nack;
        }
    }
    counters.bus_queued.fetch_add(1, Ordering::Relaxed);

    if let Some(db_tx) = db_tx {
        match timeout(DB_OFFER_TIMEOUT, db_tx.send(queued)).await {
            Ok(Ok(())) => {
                counters.db_queued.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(_)) | Err(_) => {
                // Overload drop: the message was already broadcast and will
                // be acked; it just never reaches storage.
                warn!("DB write queue full, dropping message");
                counters.db_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    counters.processed.fetch_add(1, Ordering::Relaxed);
    DeliveryOutcome::Ack
}

// =============================================================================
// WORKER LOOP
// =============================================================================

/// Drive one (room, replica) worker until shutdown, re-creating the channel
/// after faults. Ack failures orphan the in-flight batch; the broker
/// redelivers once the replacement consumer attaches.
pub async fn worker_main(
    conn: Arc<Connection>,
    room: RoomId,
    replica: usize,
    prefetch: u16,
    bus_tx: mpsc::Sender<BusPublish>,
    db_tx: Option<mpsc::Sender<QueuedMessage>>,
    counters: Arc<ConsumerCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match run_worker(
            &conn,
            room,
            replica,
            prefetch,
            &bus_tx,
            db_tx.as_ref(),
            &counters,
            &mut shutdown,
        )
        .await
        {
            Ok(()) => return,
            Err(e) => {
                error!("worker {}/{} faulted: {}", room, replica, e);
            }
        }
        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(WORKER_RESTART_DELAY).await;
    }
}

async fn run_worker(
    conn: &Connection,
    room: RoomId,
    replica: usize,
    prefetch: u16,
    bus_tx: &mpsc::Sender<BusPublish>,
    db_tx: Option<&mpsc::Sender<QueuedMessage>>,
    counters: &ConsumerCounters,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), lapin::Error> {
    let channel = conn.create_channel().await?;
    channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
    let mut consumer = channel
        .basic_consume(
            &queue_name(room),
            &format!("chatflow-{}-{}", room, replica),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    debug!("worker {}/{} consuming (prefetch {})", room, replica, prefetch);

    let mut batcher = AckBatcher::new(ACK_BATCH_SIZE);
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = consumer.next() => delivery,
        };
        let Some(delivery) = delivery else { break };
        let delivery = delivery?;
        let tag = delivery.delivery_tag;

        match process_delivery(&delivery.data, bus_tx, db_tx, counters).await {
            DeliveryOutcome::Ack => {
                if let Some(flush) = batcher.track(tag) {
                    channel
                        .basic_ack(flush.up_to, BasicAckOptions { multiple: true })
                        .await?;
                    counters.acked.fetch_add(flush.count, Ordering::Relaxed);
                }
            }
            DeliveryOutcome::Nack => {
                // The prior batch must be settled before the nack so the
                // nack is never swallowed by a later multi-ack.
                if let Some(flush) = batcher.flush() {
                    channel
                        .basic_ack(flush.up_to, BasicAckOptions { multiple: true })
                        .await?;
                    counters.acked.fetch_add(flush.count, Ordering::Relaxed);
                }
                channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: false,
                        },
                    )
                    .await?;
                counters.nacked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Cancellation path: settle whatever the batch still holds.
    if let Some(flush) = batcher.flush() {
        channel
            .basic_ack(flush.up_to, BasicAckOptions { multiple: true })
            .await?;
        counters.acked.fetch_add(flush.count, Ordering::Relaxed);
    }
    info!("worker {}/{} stopped", room, replica);
    Ok(())
}
