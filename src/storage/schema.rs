//! Schema bootstrap and the monthly partition manager.
//!
//! Everything here is idempotent; every process may run it at startup and
//! the daily re-check only ever creates what is missing.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

/// Messages land in a range-partitioned table keyed by write time.
const CREATE_MESSAGES: &str = "\
CREATE TABLE IF NOT EXISTS chat_messages (
    message_id       UUID        NOT NULL,
    user_id          INTEGER     NOT NULL,
    username         VARCHAR(20) NOT NULL,
    message          TEXT        NOT NULL,
    message_type     VARCHAR(8)  NOT NULL,
    room_id          INTEGER     NOT NULL,
    client_timestamp TIMESTAMPTZ NOT NULL,
    server_timestamp TIMESTAMPTZ NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (message_id, created_at)
) PARTITION BY RANGE (created_at)";

const CREATE_INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_room_time
         ON chat_messages (room_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_user_time
         ON chat_messages (user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_time_user
         ON chat_messages (created_at, user_id)",
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_user_room_time
         ON chat_messages (user_id, room_id, created_at DESC)",
];

const CREATE_USER_ACTIVITY: &str = "\
CREATE TABLE IF NOT EXISTS user_activity (
    user_id       INTEGER     PRIMARY KEY,
    username      VARCHAR(20) NOT NULL,
    message_count BIGINT      NOT NULL DEFAULT 0,
    rooms         JSONB       NOT NULL DEFAULT '[]'::jsonb,
    last_activity TIMESTAMPTZ NOT NULL
)";

const CREATE_ROOM_ACTIVITY: &str = "\
CREATE TABLE IF NOT EXISTS room_activity (
    room_id       INTEGER     PRIMARY KEY,
    message_count BIGINT      NOT NULL DEFAULT 0,
    last_activity TIMESTAMPTZ NOT NULL
)";

/// Summary upserts ride an AFTER INSERT trigger so ON CONFLICT DO NOTHING
/// duplicates never double-count.
const CREATE_ACTIVITY_FN: &str = "\
CREATE OR REPLACE FUNCTION chat_messages_activity() RETURNS trigger AS $$
BEGIN
    INSERT INTO user_activity (user_id, username, message_count, rooms, last_activity)
    VALUES (NEW.user_id, NEW.username, 1, jsonb_build_array(NEW.room_id), NEW.created_at)
    ON CONFLICT (user_id) DO UPDATE SET
        username      = EXCLUDED.username,
        message_count = user_activity.message_count + 1,
        rooms         = CASE
                            WHEN user_activity.rooms @> to_jsonb(NEW.room_id)
                            THEN user_activity.rooms
                            ELSE user_activity.rooms || to_jsonb(NEW.room_id)
                        END,
        last_activity = GREATEST(user_activity.last_activity, EXCLUDED.last_activity);

    INSERT INTO room_activity (room_id, message_count, last_activity)
    VALUES (NEW.room_id, 1, NEW.created_at)
    ON CONFLICT (room_id) DO UPDATE SET
        message_count = room_activity.message_count + 1,
        last_activity = GREATEST(room_activity.last_activity, EXCLUDED.last_activity);

    RETURN NULL;
END;
$$ LANGUAGE plpgsql";

const DROP_ACTIVITY_TRIGGER: &str =
    "DROP TRIGGER IF EXISTS trg_chat_messages_activity ON chat_messages";

const CREATE_ACTIVITY_TRIGGER: &str = "\
CREATE TRIGGER trg_chat_messages_activity
    AFTER INSERT ON chat_messages
    FOR EACH ROW EXECUTE FUNCTION chat_messages_activity()";

/// Create tables, indexes, summaries, and the activity trigger.
pub async fn bootstrap(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(CREATE_MESSAGES).execute(pool).await?;
    for stmt in CREATE_INDEXES {
        sqlx::query(stmt).execute(pool).await?;
    }
    sqlx::query(CREATE_USER_ACTIVITY).execute(pool).await?;
    sqlx::query(CREATE_ROOM_ACTIVITY).execute(pool).await?;
    sqlx::query(CREATE_ACTIVITY_FN).execute(pool).await?;
    sqlx::query(DROP_ACTIVITY_TRIGGER).execute(pool).await?;
    sqlx::query(CREATE_ACTIVITY_TRIGGER).execute(pool).await?;
    info!("storage schema ready");
    Ok(())
}

/// Create the monthly partitions covering `now` and the following month.
pub async fn ensure_partitions(pool: &PgPool, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
    let current = first_of_month(now.date_naive());
    for start in [current, next_month(current)] {
        let end = next_month(start);
        let name = partition_name(start);
        // Identifiers cannot be bound; the name and bounds are derived from
        // a date, never from input.
        let stmt = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF chat_messages \
             FOR VALUES FROM ('{start}') TO ('{end}')",
        );
        sqlx::query(&stmt).execute(pool).await?;
        debug!("partition {} covers [{}, {})", name, start, end);
    }
    Ok(())
}

pub fn partition_name(month_start: NaiveDate) -> String {
    format!(
        "chat_messages_y{:04}m{:02}",
        month_start.year(),
        month_start.month()
    )
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).expect("day 1 exists in every month")
}

fn next_month(month_start: NaiveDate) -> NaiveDate {
    month_start + Months::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn partition_names() {
        assert_eq!(partition_name(date(2025, 1, 1)), "chat_messages_y2025m01");
        assert_eq!(partition_name(date(2025, 12, 1)), "chat_messages_y2025m12");
    }

    #[test]
    fn month_windows_roll_over_year_end() {
        let start = first_of_month(date(2025, 12, 19));
        assert_eq!(start, date(2025, 12, 1));
        assert_eq!(next_month(start), date(2026, 1, 1));
        assert_eq!(next_month(date(2026, 1, 1)), date(2026, 2, 1));
    }

    #[test]
    fn partition_bounds_are_contiguous() {
        let mut start = first_of_month(date(2025, 1, 15));
        for _ in 0..24 {
            let end = next_month(start);
            assert_eq!(end, first_of_month(end));
            assert!(end > start);
            start = end;
        }
    }
}
