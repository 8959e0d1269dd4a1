//! Edge-side broker publishing.
//!
//! Channels are task-affine: every connection handler owns its own
//! [`RoomPublisher`] and never shares the underlying channel. The channel is
//! created lazily in confirm mode; a publish fault discards it and the next
//! publish re-creates it, so one broken channel never poisons a connection
//! for good.
//!
//! The [`Ingress`] seam exists so the edge can be driven in tests without a
//! live broker; the only production implementation is [`BrokerIngress`].

use crate::fabric::topology::{routing_key, EXCHANGE};
use crate::types::RoomId;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::{BasicProperties, Channel, Connection};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Persistent delivery (survives broker restart).
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker publish failed: {0}")]
    Broker(#[from] lapin::Error),
}

/// Publish seam consumed by the edge frame handler.
pub trait Ingress: Send + 'static {
    fn publish(
        &mut self,
        room: RoomId,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Hands each connection task its own publisher.
pub trait IngressFactory: Send + Sync + 'static {
    type Publisher: Ingress;

    fn publisher(&self) -> Self::Publisher;
}

/// A task-owned confirm-mode publisher over a shared broker connection.
pub struct RoomPublisher {
    conn: Arc<Connection>,
    channel: Option<Channel>,
}

impl RoomPublisher {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn, channel: None }
    }

    async fn ensure_channel(&mut self) -> Result<&Channel, lapin::Error> {
        if self.channel.is_none() {
            let channel = self.conn.create_channel().await?;
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
            debug!("publisher channel created (id={})", channel.id());
            self.channel = Some(channel);
        }
        Ok(self.channel.as_ref().unwrap())
    }
}

impl Ingress for RoomPublisher {
    async fn publish(&mut self, room: RoomId, payload: &[u8]) -> Result<(), PublishError> {
        let result = async {
            let channel = self.ensure_channel().await?;
            // Success is local send-success: the confirm-mode channel will
            // surface broker rejection as a fault on a later publish rather
            // than adding a confirm round-trip to every ack.
            channel
                .basic_publish(
                    EXCHANGE,
                    &routing_key(room),
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default()
                        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                        .with_content_type("application/json".into()),
                )
                .await?;
            Ok::<(), lapin::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!("publish to room {} failed, discarding channel: {}", room, e);
            self.channel = None;
            return Err(PublishError::Broker(e));
        }
        Ok(())
    }
}

/// Production ingress: one shared connection, one channel per task.
#[derive(Clone)]
pub struct BrokerIngress {
    conn: Arc<Connection>,
}

impl BrokerIngress {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }
}

impl IngressFactory for BrokerIngress {
    type Publisher = RoomPublisher;

    fn publisher(&self) -> RoomPublisher {
        RoomPublisher::new(self.conn.clone())
    }
}
