//! Edge socket tests against a live in-process server.
//!
//! The server is the real axum router with a stub broker seam, driven by
//! real tokio-tungstenite clients, so the upgrade path, close codes,
//! envelope contract, membership bookkeeping, and fan-out all run over
//! actual sockets.

use chatflow::client::{send_with_retry, CircuitBreaker, ConnectionPool};
use chatflow::edge::{router, EdgeApp, RoomMembership};
use chatflow::fabric::{Ingress, IngressFactory, PublishError};
use chatflow::metrics::{ClientCounters, EdgeCounters};
use chatflow::types::{ChatMessage, MessageType, QueuedMessage, RoomId};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Default)]
struct StubIngress {
    published: Arc<Mutex<Vec<(RoomId, Vec<u8>)>>>,
    fail: bool,
}

struct StubPublisher {
    published: Arc<Mutex<Vec<(RoomId, Vec<u8>)>>>,
    fail: bool,
}

impl IngressFactory for StubIngress {
    type Publisher = StubPublisher;

    fn publisher(&self) -> StubPublisher {
        StubPublisher {
            published: self.published.clone(),
            fail: self.fail,
        }
    }
}

impl Ingress for StubPublisher {
    async fn publish(&mut self, room: RoomId, payload: &[u8]) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Broker(lapin::Error::InvalidChannelState(
                lapin::ChannelState::Error,
            )));
        }
        self.published.lock().unwrap().push((room, payload.to_vec()));
        Ok(())
    }
}

struct TestEdge {
    addr: SocketAddr,
    membership: Arc<RoomMembership>,
    published: Arc<Mutex<Vec<(RoomId, Vec<u8>)>>>,
    counters: Arc<EdgeCounters>,
}

async fn start_edge(fail_publishes: bool) -> TestEdge {
    let membership = Arc::new(RoomMembership::new());
    let counters = Arc::new(EdgeCounters::default());
    let ingress = StubIngress {
        fail: fail_publishes,
        ..Default::default()
    };
    let published = ingress.published.clone();
    let app = Arc::new(EdgeApp::new(membership.clone(), ingress, counters.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(app)).await.unwrap();
    });

    TestEdge {
        addr,
        membership,
        published,
        counters,
    }
}

async fn connect(addr: SocketAddr, path_room: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/chat/{}", addr, path_room))
        .await
        .unwrap();
    ws
}

fn valid_frame(room: u32) -> String {
    serde_json::to_string(&ChatMessage {
        user_id: 1,
        username: "abc".to_string(),
        message: "hi".to_string(),
        timestamp: "2025-01-01T00:00:00Z".to_string(),
        message_type: MessageType::Text,
        room_id: room,
    })
    .unwrap()
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        match ws.next().await.expect("stream open").expect("frame ok") {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn expect_close_4000(ws: &mut Ws) {
    loop {
        match ws.next().await.expect("stream open").expect("frame ok") {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4000);
                return;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected close 4000, got {:?}", other),
        }
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn malformed_path_rooms_close_4000() {
    let edge = start_edge(false).await;
    for path in ["0", "21", "seven"] {
        let mut ws = connect(edge.addr, path).await;
        expect_close_4000(&mut ws).await;
    }
    assert_eq!(edge.membership.connection_count(), 0);
}

#[tokio::test]
async fn body_room_mismatch_closes_4000() {
    let edge = start_edge(false).await;
    let mut ws = connect(edge.addr, "8").await;
    ws.send(Message::Text(valid_frame(7))).await.unwrap();
    expect_close_4000(&mut ws).await;
    assert!(edge.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn twelve_malformed_frames_get_twelve_parse_errors() {
    let edge = start_edge(false).await;
    let mut ws = connect(edge.addr, "7").await;
    for _ in 0..12 {
        ws.send(Message::Text(r#"{"userId":"#.to_string())).await.unwrap();
    }
    for _ in 0..12 {
        let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(reply["error"], "PARSE_ERROR");
    }
    assert!(edge.published.lock().unwrap().is_empty());
    assert_eq!(edge.counters.snapshot().parse_errors, 12);
}

#[tokio::test]
async fn accepted_message_publishes_and_acks() {
    let edge = start_edge(false).await;
    let mut ws = connect(edge.addr, "7").await;
    ws.send(Message::Text(valid_frame(7))).await.unwrap();

    let ack: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(ack["status"], "OK");
    assert_eq!(ack["userId"], 1);
    assert_eq!(ack["message"], "hi");

    let published = edge.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    let queued: QueuedMessage = serde_json::from_slice(&published[0].1).unwrap();
    assert_eq!(queued.room_id, 7);
    assert_eq!(queued.message.username, "abc");
}

#[tokio::test]
async fn broker_failure_surfaces_as_queue_error() {
    let edge = start_edge(true).await;
    let mut ws = connect(edge.addr, "3").await;
    ws.send(Message::Text(valid_frame(3))).await.unwrap();

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["error"], "QUEUE_ERROR");
    assert!(edge.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn validation_reject_leaves_no_state() {
    let edge = start_edge(false).await;
    let mut ws = connect(edge.addr, "7").await;
    let frame = valid_frame(7).replace("\"hi\"", "\"\"");
    ws.send(Message::Text(frame)).await.unwrap();

    let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(reply["error"], "VALIDATION_ERROR");
    assert!(reply["message"].as_str().unwrap().contains("message"));
    assert!(edge.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn close_deregisters_from_membership() {
    let edge = start_edge(false).await;
    let membership = edge.membership.clone();
    let ws = connect(edge.addr, "5").await;
    wait_for(|| membership.connection_count() == 1, "registration").await;
    assert_eq!(membership.room_size(5), 1);

    drop(ws);
    wait_for(|| membership.connection_count() == 0, "deregistration").await;
    assert_eq!(membership.room_size(5), 0);
}

#[tokio::test]
async fn bus_payloads_fan_out_to_room_members_only() {
    let edge = start_edge(false).await;
    let membership = edge.membership.clone();
    let mut a = connect(edge.addr, "7").await;
    let mut b = connect(edge.addr, "7").await;
    let mut c = connect(edge.addr, "8").await;
    wait_for(|| membership.connection_count() == 3, "three registrations").await;

    // The same call the bus bridge makes on delivery.
    let payload = r#"{"userId":1,"username":"abc","message":"hi","messageType":"TEXT","roomId":7,"clientTimestamp":"2025-01-01T00:00:00Z","serverTimestamp":1735689600000}"#;
    let outcome = membership.broadcast(7, payload);
    assert_eq!(outcome.delivered, 2);

    assert_eq!(next_text(&mut a).await, payload);
    assert_eq!(next_text(&mut b).await, payload);

    let quiet = tokio::time::timeout(Duration::from_millis(200), c.next()).await;
    assert!(quiet.is_err(), "room 8 must not receive room 7 traffic");
}

#[tokio::test]
async fn load_client_round_trips_through_the_pool() {
    let edge = start_edge(false).await;
    let pool = ConnectionPool::new(format!("ws://{}", edge.addr));
    let circuit = CircuitBreaker::default();
    let counters = ClientCounters::default();

    let msg = ChatMessage {
        user_id: 42,
        username: "loadgen".to_string(),
        message: "round trip".to_string(),
        timestamp: "2025-01-01T00:00:00Z".to_string(),
        message_type: MessageType::Text,
        room_id: 9,
    };
    send_with_retry(msg, &pool, &circuit, &counters).await;

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.acked, 1);
    assert_eq!(snapshot.failed, 0);
    assert!(snapshot.latency_max_micros > 0);

    // The connection came back to the pool healthy.
    assert_eq!(pool.idle_count(9).await, 1);
    let published = edge.published.lock().unwrap();
    assert_eq!(published.len(), 1);
    pool.close_all().await;
}

#[tokio::test]
async fn rejected_sends_exhaust_attempts_and_count_one_failure() {
    let edge = start_edge(true).await;
    let pool = ConnectionPool::new(format!("ws://{}", edge.addr));
    let circuit = CircuitBreaker::default();
    let counters = ClientCounters::default();

    let msg = ChatMessage {
        user_id: 7,
        username: "loadgen".to_string(),
        message: "doomed".to_string(),
        timestamp: "2025-01-01T00:00:00Z".to_string(),
        message_type: MessageType::Text,
        room_id: 2,
    };
    send_with_retry(msg, &pool, &circuit, &counters).await;

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.acked, 0);
    assert_eq!(snapshot.retries, 4);
    assert_eq!(snapshot.sent, 5);
    pool.close_all().await;
}
