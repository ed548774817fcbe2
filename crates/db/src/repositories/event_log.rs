use sqlx::{sqlite::SqliteRow, Row};

use exportdesk_core::domain::agent::AgentEvent;

use super::rows::{decode_json, encode_json, parse_timestamp, to_i64};
use super::{EventLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEventLogRepository {
    pool: DbPool,
}

impl SqlEventLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EventLogRepository for SqlEventLogRepository {
    async fn append(&self, event: &AgentEvent) -> Result<u64, RepositoryError> {
        let inserted = sqlx::query(
            "INSERT INTO agent_event (
                event_type,
                payload_json,
                published_by,
                published_at
             ) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.event_type)
        .bind(encode_json("payload_json", &event.payload)?)
        .bind(&event.published_by)
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let sequence = inserted.last_insert_rowid();
        u64::try_from(sequence)
            .map_err(|_| RepositoryError::Decode(format!("invalid event sequence {sequence}")))
    }

    async fn list(
        &self,
        event_type: Option<&str>,
        since_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, RepositoryError> {
        let since = since_sequence
            .map(|value| {
                i64::try_from(value)
                    .map_err(|_| RepositoryError::Encode(format!("`seq` out of range: {value}")))
            })
            .transpose()?
            .unwrap_or(0);

        let rows = sqlx::query(
            "SELECT
                seq,
                event_type,
                payload_json,
                published_by,
                published_at
             FROM agent_event
             WHERE seq > ? AND (? IS NULL OR event_type = ?)
             ORDER BY seq ASC
             LIMIT ?",
        )
        .bind(since)
        .bind(event_type)
        .bind(event_type)
        .bind(to_i64("limit", limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: SqliteRow) -> Result<AgentEvent, RepositoryError> {
    let sequence = row.try_get::<i64, _>("seq")?;

    Ok(AgentEvent {
        event_type: row.try_get("event_type")?,
        payload: decode_json("payload_json", &row.try_get::<String, _>("payload_json")?)?,
        published_by: row.try_get("published_by")?,
        timestamp: parse_timestamp("published_at", row.try_get("published_at")?)?,
        sequence: Some(u64::try_from(sequence).map_err(|_| {
            RepositoryError::Decode(format!("invalid event sequence {sequence}"))
        })?),
    })
}
