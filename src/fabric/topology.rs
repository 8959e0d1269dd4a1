//! Durable, room-keyed broker topology.
//!
//! One direct exchange, one bounded durable queue per room, one dead-letter
//! exchange and queue. Declaration is idempotent: every process (edge and
//! consumer alike) declares on startup and the broker treats re-declaration
//! of identical entities as a no-op.

use crate::config::BrokerConfig;
use crate::types::{RoomId, ROOM_MAX, ROOM_MIN};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Ingest exchange; routing key is the decimal room id.
pub const EXCHANGE: &str = "chat.exchange";

/// Dead-letter exchange fed by room queues (rejections and overflow).
pub const DLX_EXCHANGE: &str = "chat.dlx.exchange";

pub const DLQ_QUEUE: &str = "chat.dlq";
pub const DLQ_ROUTING_KEY: &str = "dlq";

/// Per-queue length bound; overflow dead-letters the oldest messages.
pub const MAX_QUEUE_LENGTH: i32 = 50_000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub fn queue_name(room: RoomId) -> String {
    format!("chat.room.{}", room)
}

pub fn routing_key(room: RoomId) -> String {
    room.to_string()
}

/// Connect to the broker with a bounded wait.
pub async fn connect_broker(config: &BrokerConfig) -> Result<Connection, lapin::Error> {
    let url = config.amqp_url();
    match timeout(
        CONNECT_TIMEOUT,
        Connection::connect(&url, ConnectionProperties::default()),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(lapin::Error::InvalidConnectionState(
            lapin::ConnectionState::Error,
        )),
    }
}

/// Declare the full topology on the given channel.
pub async fn declare_topology(channel: &Channel) -> Result<(), lapin::Error> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
        .await?;
    channel
        .exchange_declare(DLX_EXCHANGE, ExchangeKind::Direct, durable, FieldTable::default())
        .await?;

    // Dead-letter queue first so room queues can reference the DLX safely.
    channel
        .queue_declare(
            DLQ_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DLQ_QUEUE,
            DLX_EXCHANGE,
            DLQ_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    for room in ROOM_MIN..=ROOM_MAX {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DLX_EXCHANGE.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
        );
        args.insert("x-max-length".into(), AMQPValue::LongInt(MAX_QUEUE_LENGTH));

        let name = queue_name(room);
        channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                &name,
                EXCHANGE,
                &routing_key(room),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    info!(
        "broker topology declared: {} + {} room queues + DLQ",
        EXCHANGE,
        ROOM_MAX - ROOM_MIN + 1
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_contract() {
        assert_eq!(queue_name(1), "chat.room.1");
        assert_eq!(queue_name(20), "chat.room.20");
        assert_eq!(routing_key(7), "7");
    }
}
