//! Parameterised analytical queries over the message archive.
//!
//! History queries hit the partitioned table through its secondary indexes;
//! the top-N queries read the trigger-maintained summary tables instead of
//! scanning history.

use super::{Storage, StorageError};
use crate::types::RoomId;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Hard caps regardless of what the caller asks for.
const ROOM_HISTORY_MAX_ROWS: i64 = 1_000;
const USER_HISTORY_MAX_ROWS: i64 = 10_000;

/// A persisted message row.
#[derive(Debug, Clone, FromRow)]
pub struct StoredMessage {
    pub message_id: Uuid,
    pub user_id: i32,
    pub username: String,
    pub message: String,
    pub message_type: String,
    pub room_id: i32,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct RoomsForUser {
    pub room_id: i32,
    pub message_count: i64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MinuteCount {
    pub minute: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TopUser {
    pub user_id: i32,
    pub username: String,
    pub message_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TopRoom {
    pub room_id: i32,
    pub message_count: i64,
}

impl Storage {
    /// Room history in `[from, to]`, newest first.
    pub async fn room_history(
        &self,
        room: RoomId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let rows = sqlx::query_as::<_, StoredMessage>(
            "SELECT message_id, user_id, username, message, message_type, room_id, \
                    client_timestamp, server_timestamp, created_at \
             FROM chat_messages \
             WHERE room_id = $1 AND created_at BETWEEN $2 AND $3 \
             ORDER BY created_at DESC \
             LIMIT $4",
        )
        .bind(room as i32)
        .bind(from)
        .bind(to)
        .bind(limit.clamp(1, ROOM_HISTORY_MAX_ROWS))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One user's history in `[from, to]`, newest first.
    pub async fn user_history(
        &self,
        user_id: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let rows = sqlx::query_as::<_, StoredMessage>(
            "SELECT message_id, user_id, username, message, message_type, room_id, \
                    client_timestamp, server_timestamp, created_at \
             FROM chat_messages \
             WHERE user_id = $1 AND created_at BETWEEN $2 AND $3 \
             ORDER BY created_at DESC \
             LIMIT $4",
        )
        .bind(user_id as i32)
        .bind(from)
        .bind(to)
        .bind(limit.clamp(1, USER_HISTORY_MAX_ROWS))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Distinct users active in `[from, to]`.
    pub async fn active_users(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<i32>, StorageError> {
        let users = sqlx::query_scalar::<_, i32>(
            "SELECT DISTINCT user_id FROM chat_messages \
             WHERE created_at BETWEEN $1 AND $2 \
             ORDER BY user_id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    /// Rooms a user has spoken in, with per-room count and last activity.
    pub async fn rooms_for_user(&self, user_id: u32) -> Result<Vec<RoomsForUser>, StorageError> {
        let rows = sqlx::query_as::<_, RoomsForUser>(
            "SELECT room_id, COUNT(*) AS message_count, MAX(created_at) AS last_activity \
             FROM chat_messages \
             WHERE user_id = $1 \
             GROUP BY room_id \
             ORDER BY last_activity DESC",
        )
        .bind(user_id as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Message volume per minute in `[from, to]`.
    pub async fn messages_per_minute(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MinuteCount>, StorageError> {
        let rows = sqlx::query_as::<_, MinuteCount>(
            "SELECT date_trunc('minute', created_at) AS minute, COUNT(*) AS message_count \
             FROM chat_messages \
             WHERE created_at BETWEEN $1 AND $2 \
             GROUP BY 1 \
             ORDER BY 1",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Top-N users by lifetime message count, from the summary table.
    pub async fn top_users(&self, n: i64) -> Result<Vec<TopUser>, StorageError> {
        let rows = sqlx::query_as::<_, TopUser>(
            "SELECT user_id, username, message_count \
             FROM user_activity \
             ORDER BY message_count DESC \
             LIMIT $1",
        )
        .bind(n.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Top-N rooms by lifetime message count, from the summary table.
    pub async fn top_rooms(&self, n: i64) -> Result<Vec<TopRoom>, StorageError> {
        let rows = sqlx::query_as::<_, TopRoom>(
            "SELECT room_id, message_count \
             FROM room_activity \
             ORDER BY message_count DESC \
             LIMIT $1",
        )
        .bind(n.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
