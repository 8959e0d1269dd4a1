//! Bus bridge: one process-wide pattern subscriber feeding local fan-out.
//!
//! The bridge holds a read-only handle to the membership maps the edge
//! owns. Delivery is best-effort per connection; a full outbound queue on
//! one socket never blocks the rest of the room, and never fails the bus
//! message. A lost subscriber connection reconnects forever at a fixed
//! interval.

use crate::edge::membership::RoomMembership;
use crate::metrics::EdgeCounters;
use crate::types::{room_from_bus_channel, BUS_PATTERN};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle to the running subscriber task.
pub struct BusBridge {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl BusBridge {
    pub fn spawn(
        redis_url: String,
        membership: Arc<RoomMembership>,
        counters: Arc<EdgeCounters>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(redis_url, membership, counters, shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.handle).await.is_err() {
            warn!("bus bridge did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

async fn run(
    url: String,
    membership: Arc<RoomMembership>,
    counters: Arc<EdgeCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match pump(&url, &membership, &counters, &mut shutdown).await {
            Ok(()) => return,
            Err(e) => warn!("bus subscriber lost: {}", e),
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Subscribe and fan out until the stream dies or shutdown is requested.
/// Ok means shutdown; Err means reconnect.
async fn pump(
    url: &str,
    membership: &RoomMembership,
    counters: &EdgeCounters,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(BUS_PATTERN).await?;
    info!("bus subscriber listening on {}", BUS_PATTERN);

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pubsub stream ended",
                    )));
                };
                let channel = msg.get_channel_name().to_string();
                let Some(room) = room_from_bus_channel(&channel) else {
                    debug!("ignoring delivery on unexpected channel {}", channel);
                    continue;
                };
                let payload: String = msg.get_payload()?;
                let outcome = membership.broadcast(room, &payload);
                counters
                    .broadcasts_delivered
                    .fetch_add(outcome.delivered, Ordering::Relaxed);
                counters
                    .broadcasts_failed
                    .fetch_add(outcome.failed, Ordering::Relaxed);
            }
        }
    }
}
