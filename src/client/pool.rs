//! Room-keyed WebSocket connection pool.
//!
//! Connections are persistent and reused per room, bounded per key. Each
//! connection owns a reader task that routes reply envelopes into a
//! response queue; since a worker holds a connection exclusively for one
//! request at a time, correlation is first-in-first-out on that queue.

use crate::types::RoomId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open-handshake deadline for a fresh connection.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections kept per room.
const MAX_PER_ROOM: usize = 10;

/// Depth of the per-connection response queue.
const RESPONSE_BUFFER: usize = 64;

/// Heartbeat ping interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect timed out after {OPEN_TIMEOUT:?}")]
    ConnectTimeout,
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error("no ack within the response timeout")]
    AckTimeout,
    #[error("server rejected the message: {0}")]
    Rejected(String),
}

/// One pooled socket and its reader task.
pub struct PooledConnection {
    room: RoomId,
    writer: SplitSink<WsStream, Message>,
    responses: mpsc::Receiver<String>,
    healthy: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl PooledConnection {
    pub async fn open(url: &str, room: RoomId) -> Result<Self, ClientError> {
        let (stream, _response) = timeout(OPEN_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        let (writer, read) = stream.split();

        let healthy = Arc::new(AtomicBool::new(true));
        let (tx, responses) = mpsc::channel(RESPONSE_BUFFER);
        let reader = tokio::spawn(read_loop(read, tx, healthy.clone()));

        Ok(Self {
            room,
            writer,
            responses,
            healthy,
            reader,
        })
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn send(&mut self, text: String) -> Result<(), ClientError> {
        if let Err(e) = self.writer.send(Message::Text(text)).await {
            self.healthy.store(false, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Await the next reply envelope. Timeouts leave the connection
    /// unhealthy: a late reply would correlate with the wrong request.
    pub async fn recv_response(&mut self, wait: Duration) -> Result<String, ClientError> {
        match timeout(wait, self.responses.recv()).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(ClientError::Closed)
            }
            Err(_) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(ClientError::AckTimeout)
            }
        }
    }

    /// Heartbeat ping over the real socket.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        if let Err(e) = self.writer.send(Message::Ping(Vec::new())).await {
            self.healthy.store(false, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn close(mut self) {
        let _ = self.writer.send(Message::Close(None)).await;
        self.reader.abort();
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    tx: mpsc::Sender<String>,
    healthy: Arc<AtomicBool>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if tx.send(text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Pongs and pings are liveness traffic, not responses.
            Ok(_) => {}
        }
    }
    healthy.store(false, Ordering::Relaxed);
}

/// Pool of persistent connections keyed by room.
pub struct ConnectionPool {
    base_url: String,
    pools: Mutex<HashMap<RoomId, VecDeque<PooledConnection>>>,
}

impl ConnectionPool {
    /// `base_url` is the edge origin, e.g. `ws://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn url_for(&self, room: RoomId) -> String {
        format!("{}/chat/{}", self.base_url, room)
    }

    /// Pop a healthy pooled connection or dial a new one.
    pub async fn get(&self, room: RoomId) -> Result<PooledConnection, ClientError> {
        let mut stale = Vec::new();
        let reused = {
            let mut pools = self.pools.lock().await;
            let mut found = None;
            if let Some(deque) = pools.get_mut(&room) {
                while let Some(conn) = deque.pop_front() {
                    if conn.is_healthy() {
                        found = Some(conn);
                        break;
                    }
                    stale.push(conn);
                }
            }
            found
        };
        for conn in stale {
            conn.close().await;
        }
        match reused {
            Some(conn) => Ok(conn),
            None => PooledConnection::open(&self.url_for(room), room).await,
        }
    }

    /// Return a connection iff the pool has room and it is still healthy;
    /// otherwise close it.
    pub async fn put(&self, conn: PooledConnection) {
        if !conn.is_healthy() {
            conn.close().await;
            return;
        }
        let rejected = {
            let mut pools = self.pools.lock().await;
            let deque = pools.entry(conn.room()).or_default();
            if deque.len() < MAX_PER_ROOM {
                deque.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = rejected {
            conn.close().await;
        }
    }

    /// Ping every idle connection; send failures flip the health flag and
    /// the connection is culled on its next pop.
    pub async fn ping_idle(&self) {
        let mut pools = self.pools.lock().await;
        for (room, deque) in pools.iter_mut() {
            for conn in deque.iter_mut() {
                if conn.ping().await.is_err() {
                    warn!("heartbeat failed for a room {} connection", room);
                }
            }
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<PooledConnection> = {
            let mut pools = self.pools.lock().await;
            pools.drain().flat_map(|(_, deque)| deque).collect()
        };
        for conn in drained {
            conn.close().await;
        }
        debug!("connection pool closed");
    }

    pub async fn idle_count(&self, room: RoomId) -> usize {
        self.pools
            .lock()
            .await
            .get(&room)
            .map(|d| d.len())
            .unwrap_or(0)
    }
}

/// Periodic heartbeat over every idle pooled connection.
pub fn spawn_heartbeat(pool: Arc<ConnectionPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            pool.ping_idle().await;
        }
    })
}
