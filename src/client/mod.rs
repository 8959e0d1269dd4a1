//! Closed-loop load client.
//!
//! One generator fills a bounded queue; sender workers drain it through the
//! connection pool, waiting for the reply envelope per message. Retries are
//! capped with exponential backoff and every attempt consults the circuit
//! breaker first, so a dead edge is probed instead of hammered.

pub mod breaker;
pub mod pool;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use pool::{spawn_heartbeat, ClientError, ConnectionPool, PooledConnection};

use crate::metrics::{ClientCounters, ClientSnapshot};
use crate::types::{iso_now, ChatMessage, MessageType, RoomId, ROOM_MAX, ROOM_MIN, USER_ID_MAX};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Generator queue depth.
const QUEUE_CAPACITY: usize = 10_000;

/// Bounded wait when offering a generated message to the queue; elapsing
/// drops that message and the run moves on.
const GENERATOR_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Above this queue depth workers pace themselves.
const BACKPRESSURE_THRESHOLD: i64 = 5_000;
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(10);

/// Per-message attempt cap.
const MAX_ATTEMPTS: u32 = 5;

/// First retry delay; doubles per attempt (100, 200, 400, 800, 1600 ms).
const BACKOFF_BASE_MS: u64 = 100;

/// How long a worker waits for the reply envelope.
const ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause before re-consulting an open breaker.
const BREAKER_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LoadClientConfig {
    /// Edge origin, e.g. `ws://127.0.0.1:8080`.
    pub target: String,
    /// Messages to generate in total.
    pub messages: u64,
    /// Sender worker tasks.
    pub workers: usize,
}

/// Backoff delay before retrying after `attempt` (1-based) failed.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1)))
}

/// Run the full closed loop and return the final counters.
pub async fn run(config: LoadClientConfig) -> ClientSnapshot {
    let counters = Arc::new(ClientCounters::default());
    let pool = Arc::new(ConnectionPool::new(config.target.clone()));
    let circuit = Arc::new(CircuitBreaker::default());
    let depth = Arc::new(AtomicI64::new(0));

    let (tx, rx) = mpsc::channel::<ChatMessage>(QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));

    let generator = {
        let depth = depth.clone();
        let counters = counters.clone();
        let total = config.messages;
        tokio::spawn(async move {
            for n in 0..total {
                match timeout(GENERATOR_OFFER_TIMEOUT, tx.send(random_message(n))).await {
                    Ok(Ok(())) => {
                        depth.fetch_add(1, Ordering::Relaxed);
                    }
                    // Workers are gone; nothing left to generate for.
                    Ok(Err(_)) => return,
                    Err(_) => {
                        counters.generator_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    let heartbeat = spawn_heartbeat(pool.clone());

    let mut workers = Vec::with_capacity(config.workers.max(1));
    for id in 0..config.workers.max(1) {
        let rx = rx.clone();
        let pool = pool.clone();
        let circuit = circuit.clone();
        let counters = counters.clone();
        let depth = depth.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let msg = { rx.lock().await.recv().await };
                let Some(msg) = msg else { break };
                depth.fetch_sub(1, Ordering::Relaxed);

                send_with_retry(msg, &pool, &circuit, &counters).await;

                if depth.load(Ordering::Relaxed) > BACKPRESSURE_THRESHOLD {
                    tokio::time::sleep(BACKPRESSURE_SLEEP).await;
                }
            }
            debug!("sender worker {} done", id);
        }));
    }

    let _ = generator.await;
    for worker in workers {
        let _ = worker.await;
    }
    heartbeat.abort();
    pool.close_all().await;

    let snapshot = counters.snapshot();
    info!(
        "load run complete: {} acked, {} failed, {} dropped before send, avg {}us, max {}us",
        snapshot.acked,
        snapshot.failed,
        snapshot.generator_drops,
        snapshot.latency_avg_micros,
        snapshot.latency_max_micros
    );
    snapshot
}

/// Send one message with up to [`MAX_ATTEMPTS`] tries. Consults the breaker
/// before each attempt; an open breaker pauses the worker without consuming
/// an attempt.
pub async fn send_with_retry(
    msg: ChatMessage,
    pool: &ConnectionPool,
    circuit: &CircuitBreaker,
    counters: &ClientCounters,
) {
    let payload = match serde_json::to_string(&msg) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("unserializable message skipped: {}", e);
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    for attempt in 1..=MAX_ATTEMPTS {
        while !circuit.allow_request() {
            counters.breaker_rejections.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(BREAKER_WAIT).await;
        }

        match attempt_send(&payload, msg.room_id, pool, counters).await {
            Ok(latency) => {
                circuit.record_success();
                counters.acked.fetch_add(1, Ordering::Relaxed);
                counters.record_latency(latency.as_micros() as u64);
                return;
            }
            Err(e) => {
                circuit.record_failure();
                debug!(
                    "attempt {}/{} for room {} failed: {}",
                    attempt, MAX_ATTEMPTS, msg.room_id, e
                );
                if attempt < MAX_ATTEMPTS {
                    counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
    counters.failed.fetch_add(1, Ordering::Relaxed);
}

/// One attempt: pooled connection, send, await the correlated envelope.
/// A connection that timed out or errored is closed, never returned.
async fn attempt_send(
    payload: &str,
    room: RoomId,
    pool: &ConnectionPool,
    counters: &ClientCounters,
) -> Result<Duration, ClientError> {
    let mut conn = pool.get(room).await?;
    counters.sent.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    if let Err(e) = conn.send(payload.to_string()).await {
        conn.close().await;
        return Err(e);
    }

    match conn.recv_response(ACK_TIMEOUT).await {
        Ok(reply) => {
            let latency = started.elapsed();
            if reply.contains("\"status\":\"OK\"") {
                pool.put(conn).await;
                Ok(latency)
            } else {
                pool.put(conn).await;
                Err(ClientError::Rejected(reply))
            }
        }
        Err(e) => {
            conn.close().await;
            Err(e)
        }
    }
}

/// A random but always-valid message.
fn random_message(n: u64) -> ChatMessage {
    let mut rng = rand::thread_rng();
    let name_len = rng.gen_range(3..=12);
    let username: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(name_len)
        .map(char::from)
        .collect();
    ChatMessage {
        user_id: rng.gen_range(1..=USER_ID_MAX as u32),
        username,
        message: format!("load message {}", n),
        timestamp: iso_now(),
        message_type: MessageType::Text,
        room_id: rng.gen_range(ROOM_MIN..=ROOM_MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_from_100ms() {
        let delays: Vec<u64> = (1..=5).map(|a| backoff_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn generated_messages_always_validate() {
        for n in 0..200 {
            let msg = random_message(n);
            let json = serde_json::to_string(&msg).unwrap();
            let raw: crate::types::RawChatMessage = serde_json::from_str(&json).unwrap();
            let validated = raw.validate().expect("generated message must be valid");
            assert!((ROOM_MIN..=ROOM_MAX).contains(&validated.room_id));
        }
    }
}
