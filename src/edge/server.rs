//! WebSocket edge: accept, validate, publish, acknowledge.
//!
//! One connection task per socket, split into a read loop (owned by the
//! handler) and a writer task draining the connection's outbound queue, so
//! reply envelopes and bus broadcasts share a single ordered sink.
//!
//! The edge never buffers on behalf of the client: a failed broker publish
//! is answered with QUEUE_ERROR and the frame is gone. The client owns
//! retry.

use crate::edge::membership::{next_conn_id, Outbound, RoomMembership};
use crate::fabric::{Ingress, IngressFactory};
use crate::metrics::EdgeCounters;
use crate::types::{
    AckResponse, ErrorKind, ErrorResponse, QueuedMessage, RawChatMessage, RoomId, ROOM_MAX,
    ROOM_MIN,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Close code for a malformed path or a body/path room mismatch.
pub const CLOSE_INVALID_ROOM: u16 = 4000;

/// Per-connection outbound queue depth. Full queue = slow client; broadcast
/// writes to it are try_send and count as failed delivery.
const OUTBOUND_BUFFER: usize = 256;

/// Shared state for one edge process.
pub struct EdgeApp<F: IngressFactory> {
    pub membership: Arc<RoomMembership>,
    pub ingress: F,
    pub counters: Arc<EdgeCounters>,
}

impl<F: IngressFactory> EdgeApp<F> {
    pub fn new(membership: Arc<RoomMembership>, ingress: F, counters: Arc<EdgeCounters>) -> Self {
        Self {
            membership,
            ingress,
            counters,
        }
    }
}

/// Build the edge router. The only route is the chat socket.
pub fn router<F: IngressFactory>(app: Arc<EdgeApp<F>>) -> Router {
    Router::new()
        .route("/chat/{room_id}", get(ws_handler::<F>))
        .with_state(app)
}

async fn ws_handler<F: IngressFactory>(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(app): State<Arc<EdgeApp<F>>>,
) -> Response {
    let room = parse_room(&room_id);
    ws.on_upgrade(move |socket| handle_socket(app, socket, room))
}

/// A path room must be a bare decimal inside the room range; anything else
/// is rejected after the upgrade with close code 4000.
pub fn parse_room(raw: &str) -> Option<RoomId> {
    let room: RoomId = raw.parse().ok()?;
    (ROOM_MIN..=ROOM_MAX).contains(&room).then_some(room)
}

async fn handle_socket<F: IngressFactory>(
    app: Arc<EdgeApp<F>>,
    socket: WebSocket,
    room: Option<RoomId>,
) {
    let (mut sink, mut stream) = socket.split();

    let Some(room) = room else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_INVALID_ROOM,
                reason: "invalid room".into(),
            })))
            .await;
        return;
    };

    let conn = next_conn_id();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    app.membership.register(conn, room, tx.clone());
    app.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
    debug!("conn {} joined room {}", conn, room);

    // Writer task: sole owner of the sink. Exits when the outbound queue
    // closes or a close instruction is drained.
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut publisher = app.ingress.publisher();
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!("conn {} socket error: {}", conn, e);
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                match handle_frame(text.as_str(), room, &mut publisher, &app.counters).await {
                    FrameOutcome::Reply(json) => {
                        if tx.send(Outbound::Frame(json)).await.is_err() {
                            break;
                        }
                    }
                    FrameOutcome::InvalidRoom => {
                        let _ = tx
                            .send(Outbound::Close {
                                code: CLOSE_INVALID_ROOM,
                                reason: "invalid room",
                            })
                            .await;
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            // Ping/pong are answered by the protocol layer; binary frames
            // are not part of the contract.
            _ => {}
        }
    }

    app.membership.deregister(conn);
    app.counters.connections_closed.fetch_add(1, Ordering::Relaxed);
    debug!("conn {} left room {}", conn, room);
    drop(tx);
    let _ = writer.await;
}

/// Result of processing one inbound text frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Exactly one envelope goes back to the sender.
    Reply(String),
    /// Body room did not match the path room: close 4000.
    InvalidRoom,
}

/// The full ingress pipeline for one frame: parse, validate, publish.
///
/// Every exit produces either one envelope or the invalid-room close; no
/// frame is answered twice and none is silently dropped.
pub async fn handle_frame<P: Ingress>(
    text: &str,
    path_room: RoomId,
    publisher: &mut P,
    counters: &EdgeCounters,
) -> FrameOutcome {
    let raw: RawChatMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            counters.parse_errors.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Reply(envelope(&ErrorResponse::new(
                ErrorKind::Parse,
                format!("malformed message: {}", e),
            )));
        }
    };

    let msg = match raw.validate() {
        Ok(msg) => msg,
        Err(e) => {
            counters.validation_errors.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Reply(envelope(&ErrorResponse::new(
                ErrorKind::Validation,
                e.to_string(),
            )));
        }
    };

    if msg.room_id != path_room {
        return FrameOutcome::InvalidRoom;
    }

    let queued = QueuedMessage::new(msg);
    let payload = envelope(&queued);
    match publisher.publish(queued.room_id, payload.as_bytes()).await {
        Ok(()) => {
            counters.accepted.fetch_add(1, Ordering::Relaxed);
            FrameOutcome::Reply(envelope(&AckResponse::accepted(&queued.message)))
        }
        Err(e) => {
            counters.queue_errors.fetch_add(1, Ordering::Relaxed);
            warn!("room {} publish rejected: {}", queued.room_id, e);
            FrameOutcome::Reply(envelope(&ErrorResponse::new(
                ErrorKind::Queue,
                "message could not be queued",
            )))
        }
    }
}

fn envelope<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("wire types serialize to JSON")
}
