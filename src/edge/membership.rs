//! Per-room connection membership.
//!
//! Two maps, both concurrent: conn -> room (1:1) and room -> senders (1:N).
//! Writes happen only on open/close; the broadcast path is read-only and
//! must never block behind a registration, which is why both levels are
//! dashmaps rather than a single locked structure.
//!
//! The room -> senders inner maps are created once per room and never
//! removed; the room space is bounded (1..=20) so empty maps cost nothing
//! and removal races with concurrent registration are avoided entirely.

use crate::types::{RoomId, now_millis};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Process-unique connection id.
pub type ConnId = u64;

/// Close code sent to clients when the edge itself is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frames queued for a single connection's writer task.
///
/// Envelopes and broadcasts share one ordered sink per connection; a close
/// instruction travels the same path so it cannot overtake queued replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

/// Result of one room fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: u64,
    pub failed: u64,
}

pub struct RoomMembership {
    conns: DashMap<ConnId, RoomId>,
    rooms: DashMap<RoomId, DashMap<ConnId, mpsc::Sender<Outbound>>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Index a connection under its room. A connection observes at most one
    /// room for its lifetime, so re-registration replaces nothing in
    /// practice; the maps still stay consistent if it happens.
    pub fn register(&self, conn: ConnId, room: RoomId, tx: mpsc::Sender<Outbound>) {
        self.conns.insert(conn, room);
        self.rooms.entry(room).or_default().insert(conn, tx);
    }

    /// Remove a connection from both maps. Idempotent.
    pub fn deregister(&self, conn: ConnId) {
        if let Some((_, room)) = self.conns.remove(&conn) {
            if let Some(members) = self.rooms.get(&room) {
                members.remove(&conn);
            }
        }
    }

    pub fn room_of(&self, conn: ConnId) -> Option<RoomId> {
        self.conns.get(&conn).map(|r| *r)
    }

    /// Write a payload to every open connection in the room.
    ///
    /// Best-effort per connection: a full or closed outbound queue counts as
    /// a failure for that connection and the iteration moves on. Uses
    /// try_send so a slow consumer never blocks the bus subscriber.
    pub fn broadcast(&self, room: RoomId, payload: &str) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let Some(members) = self.rooms.get(&room) else {
            return outcome;
        };
        for entry in members.iter() {
            match entry.value().try_send(Outbound::Frame(payload.to_string())) {
                Ok(()) => outcome.delivered += 1,
                Err(_) => outcome.failed += 1,
            }
        }
        outcome
    }

    /// Instruct every registered connection to close, then wait for the
    /// read loops to deregister, bounded by `grace`.
    ///
    /// The close instruction rides each connection's outbound queue via
    /// try_send; a connection too backed up to take it is left to the
    /// process exit path rather than blocking shutdown.
    pub async fn close_all(&self, grace: Duration) {
        for room in self.rooms.iter() {
            for entry in room.value().iter() {
                let _ = entry.value().try_send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "server shutting down",
                });
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} connections still open after {:?}",
                    self.connection_count(),
                    grace
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn room_size(&self, room: RoomId) -> usize {
        self.rooms.get(&room).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint a process-unique connection id. Seeded from the clock only so ids
/// differ across restarts in logs; uniqueness comes from the increment.
pub fn next_conn_id() -> ConnId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    static BASE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    let base = *BASE.get_or_init(|| (now_millis() as u64) << 20);
    base | NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn connection_indexed_under_exactly_one_room() {
        let m = RoomMembership::new();
        let (tx, _rx) = chan();
        m.register(1, 7, tx);

        assert_eq!(m.room_of(1), Some(7));
        assert_eq!(m.room_size(7), 1);
        assert_eq!(m.connection_count(), 1);
        for room in 1..=20 {
            if room != 7 {
                assert_eq!(m.room_size(room), 0);
            }
        }
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let m = RoomMembership::new();
        let (tx, _rx) = chan();
        m.register(1, 3, tx);
        m.deregister(1);
        m.deregister(1);
        assert_eq!(m.connection_count(), 0);
        assert_eq!(m.room_size(3), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let m = RoomMembership::new();
        let (tx_a, mut rx_a) = chan();
        let (tx_b, mut rx_b) = chan();
        let (tx_c, mut rx_c) = chan();
        m.register(1, 7, tx_a);
        m.register(2, 7, tx_b);
        m.register(3, 8, tx_c);

        let outcome = m.broadcast(7, "hello");
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, failed: 0 });

        assert_eq!(rx_a.recv().await, Some(Outbound::Frame("hello".to_string())));
        assert_eq!(rx_b.recv().await, Some(Outbound::Frame("hello".to_string())));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_counts_full_queues_as_failed() {
        let m = RoomMembership::new();
        let (tx, _rx) = mpsc::channel(1);
        m.register(1, 5, tx.clone());
        tx.try_send(Outbound::Frame("filler".to_string())).unwrap();

        let outcome = m.broadcast(5, "dropped");
        assert_eq!(outcome, BroadcastOutcome { delivered: 0, failed: 1 });
    }

    #[tokio::test]
    async fn broadcast_to_empty_room_is_noop() {
        let m = RoomMembership::new();
        assert_eq!(m.broadcast(12, "x"), BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn close_all_instructs_and_waits_for_deregistration() {
        let m = std::sync::Arc::new(RoomMembership::new());
        let (tx, mut rx) = chan();
        m.register(1, 7, tx);

        let membership = m.clone();
        let reader = tokio::spawn(async move {
            let out = rx.recv().await;
            assert!(matches!(
                out,
                Some(Outbound::Close { code: CLOSE_GOING_AWAY, .. })
            ));
            membership.deregister(1);
        });

        m.close_all(Duration::from_secs(1)).await;
        assert_eq!(m.connection_count(), 0);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn close_all_gives_up_after_grace() {
        let m = RoomMembership::new();
        let (tx, _rx) = chan();
        m.register(1, 3, tx);

        m.close_all(Duration::from_millis(50)).await;
        // The connection never deregistered; close_all must return anyway.
        assert_eq!(m.connection_count(), 1);
    }

    #[test]
    fn conn_ids_are_unique() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert_ne!(a, b);
    }
}
