use sqlx::{sqlite::SqliteRow, Row};

use exportdesk_core::domain::journey::{
    DealJourney, JourneyHistoryEntry, JourneyId, JourneyState, JourneyTrigger,
};
use exportdesk_core::domain::Context;

use super::rows::{decode_json, encode_json, parse_timestamp, parse_u32};
use super::{JourneyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlJourneyRepository {
    pool: DbPool,
}

impl SqlJourneyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl JourneyRepository for SqlJourneyRepository {
    async fn insert(&self, journey: &DealJourney) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO deal_journey (
                id,
                current_state,
                context_json,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&journey.id.0)
        .bind(journey.current_state.as_str())
        .bind(encode_json("context_json", &journey.context)?)
        .bind(i64::from(journey.version))
        .bind(journey.created_at.to_rfc3339())
        .bind(journey.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for entry in &journey.history {
            insert_history(&mut tx, &journey.id, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &JourneyId) -> Result<Option<DealJourney>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT
                id,
                current_state,
                context_json,
                version,
                created_at,
                updated_at
             FROM deal_journey
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        // Same snapshot as the row, so history always matches the version read.
        let history = fetch_history(&mut tx, id).await?;
        tx.commit().await?;
        journey_from_row(row, history).map(Some)
    }

    async fn save_transition(
        &self,
        journey: &DealJourney,
        expected_version: u32,
        entry: &JourneyHistoryEntry,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE deal_journey
             SET current_state = ?,
                 context_json = ?,
                 version = ?,
                 updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(journey.current_state.as_str())
        .bind(encode_json("context_json", &journey.context)?)
        .bind(i64::from(journey.version))
        .bind(journey.updated_at.to_rfc3339())
        .bind(&journey.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_history(&mut tx, &journey.id, entry).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_history(
        &self,
        id: &JourneyId,
    ) -> Result<Vec<JourneyHistoryEntry>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let history = fetch_history(&mut tx, id).await?;
        tx.commit().await?;
        Ok(history)
    }
}

async fn fetch_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: &JourneyId,
) -> Result<Vec<JourneyHistoryEntry>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT
            sequence,
            from_state,
            to_state,
            trigger_name,
            actor_agent,
            occurred_at
         FROM journey_history
         WHERE journey_id = ?
         ORDER BY sequence ASC",
    )
    .bind(&id.0)
    .fetch_all(&mut **tx)
    .await?;

    rows.into_iter().map(history_from_row).collect()
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    journey_id: &JourneyId,
    entry: &JourneyHistoryEntry,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO journey_history (
            journey_id,
            sequence,
            from_state,
            to_state,
            trigger_name,
            actor_agent,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&journey_id.0)
    .bind(i64::from(entry.sequence))
    .bind(entry.from_state.as_str())
    .bind(entry.to_state.as_str())
    .bind(entry.trigger.as_str())
    .bind(&entry.actor_agent)
    .bind(entry.occurred_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn parse_state(column: &str, raw: String) -> Result<JourneyState, RepositoryError> {
    JourneyState::parse(&raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown journey state in `{column}`: `{raw}`")))
}

fn journey_from_row(
    row: SqliteRow,
    history: Vec<JourneyHistoryEntry>,
) -> Result<DealJourney, RepositoryError> {
    let context: Context = decode_json("context_json", &row.try_get::<String, _>("context_json")?)?;

    Ok(DealJourney {
        id: JourneyId(row.try_get("id")?),
        current_state: parse_state("current_state", row.try_get("current_state")?)?,
        context,
        history,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn history_from_row(row: SqliteRow) -> Result<JourneyHistoryEntry, RepositoryError> {
    let trigger_raw = row.try_get::<String, _>("trigger_name")?;
    let trigger = JourneyTrigger::parse(&trigger_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown journey trigger `{trigger_raw}`")))?;

    Ok(JourneyHistoryEntry {
        sequence: parse_u32("sequence", row.try_get("sequence")?)?,
        from_state: parse_state("from_state", row.try_get("from_state")?)?,
        to_state: parse_state("to_state", row.try_get("to_state")?)?,
        trigger,
        actor_agent: row.try_get("actor_agent")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
