//! Relational storage: schema bootstrap, idempotent batch insert,
//! analytical queries.
//!
//! Rows are identified by `(message_id, created_at)`; the id is minted
//! fresh at insert time, so redelivered broker messages collide on the key
//! and the conflict is a no-op.

pub mod analytics;
pub mod schema;

pub use analytics::{MinuteCount, RoomsForUser, StoredMessage, TopRoom, TopUser};

use crate::config::DbConfig;
use crate::types::QueuedMessage;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Bind-count ceiling per insert: Postgres caps binds at u16::MAX and each
/// row carries 8 binds, so batches above this are split.
const MAX_INSERT_ROWS: usize = 5_000;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_POOL_CONNECTIONS: u32 = 16;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Batch-insert seam consumed by the DB writer pool.
pub trait MessageStore: Send + Sync + 'static {
    fn insert_batch(
        &self,
        batch: &[QueuedMessage],
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;
}

/// Postgres-backed store.
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    /// Connect with a bounded pool; waits for a slot at most 30 s.
    pub async fn connect(config: &DbConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.pg_url())
            .await?;
        info!("connected to storage at {}:{}/{}", config.host, config.port, config.name);
        Ok(Self { pool })
    }

    /// Idempotent schema bootstrap plus partitions for the current and next
    /// month.
    pub async fn init_schema(&self) -> Result<(), StorageError> {
        schema::bootstrap(&self.pool).await?;
        self.ensure_partitions().await?;
        Ok(())
    }

    /// Guarantee monthly partitions exist for now and a month ahead.
    /// Called at bootstrap and periodically so the write path never lands
    /// in a missing partition at a month rollover.
    pub async fn ensure_partitions(&self) -> Result<(), StorageError> {
        schema::ensure_partitions(&self.pool, Utc::now()).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn insert_chunk(&self, chunk: &[QueuedMessage]) -> Result<u64, StorageError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO chat_messages \
             (message_id, user_id, username, message, message_type, room_id, \
              client_timestamp, server_timestamp) ",
        );
        builder.push_values(chunk, |mut row, m| {
            row.push_bind(Uuid::new_v4())
                .push_bind(m.message.user_id as i32)
                .push_bind(m.message.username.as_str())
                .push_bind(m.message.message.as_str())
                .push_bind(m.message.message_type.as_str())
                .push_bind(m.room_id as i32)
                .push_bind(parse_client_timestamp(m))
                .push_bind(millis_to_datetime(m.received_timestamp));
        });
        builder.push(" ON CONFLICT (message_id, created_at) DO NOTHING");

        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

impl MessageStore for Storage {
    async fn insert_batch(&self, batch: &[QueuedMessage]) -> Result<u64, StorageError> {
        let mut written = 0;
        for chunk in batch.chunks(MAX_INSERT_ROWS) {
            written += self.insert_chunk(chunk).await?;
        }
        Ok(written)
    }
}

/// The client timestamp was validated at the edge; a broker payload from
/// another producer might still carry garbage, in which case the ingress
/// time stands in.
fn parse_client_timestamp(m: &QueuedMessage) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&m.message.timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| millis_to_datetime(m.received_timestamp))
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, MessageType};

    #[test]
    fn client_timestamp_parses_or_falls_back() {
        let mut m = QueuedMessage::new(ChatMessage {
            user_id: 1,
            username: "abc".to_string(),
            message: "hi".to_string(),
            timestamp: "2025-01-01T12:30:00Z".to_string(),
            message_type: MessageType::Text,
            room_id: 3,
        });
        let parsed = parse_client_timestamp(&m);
        assert_eq!(parsed.timestamp(), 1_735_734_600);

        m.message.timestamp = "garbage".to_string();
        let fallback = parse_client_timestamp(&m);
        assert_eq!(fallback, millis_to_datetime(m.received_timestamp));
    }

    #[test]
    fn millis_round_trip() {
        let dt = millis_to_datetime(1_700_000_000_123);
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_123);
    }
}
