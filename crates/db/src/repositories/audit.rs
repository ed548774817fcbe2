use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use exportdesk_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};

use super::rows::{decode_json, encode_json, parse_timestamp, to_i64};
use super::RepositoryError;
use crate::DbPool;

/// Audit sink backed by the `audit_event` table.
///
/// `emit` hands the insert to the ambient tokio runtime; failures are logged and dropped.
#[derive(Clone)]
pub struct SqlAuditSink {
    pool: DbPool,
}

impl SqlAuditSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO audit_event (
                id,
                action,
                category,
                resource_type,
                resource_id,
                correlation_id,
                actor,
                outcome,
                metadata_json,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.action)
        .bind(event.category.as_str())
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.correlation_id)
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(encode_json("metadata_json", &event.metadata)?)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                action,
                category,
                resource_type,
                resource_id,
                correlation_id,
                actor,
                outcome,
                metadata_json,
                occurred_at
             FROM audit_event
             WHERE resource_type = ? AND resource_id = ?
             ORDER BY occurred_at ASC, id ASC
             LIMIT ?",
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(to_i64("limit", limit)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(audit_from_row).collect()
    }
}

impl AuditSink for SqlAuditSink {
    fn emit(&self, event: AuditEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                event_name = "audit.emit_dropped",
                action = %event.action,
                resource_id = %event.resource_id,
                "no async runtime available for audit insert"
            );
            return;
        };

        let sink = self.clone();
        handle.spawn(async move {
            if let Err(error) = sink.insert(&event).await {
                warn!(
                    event_name = "audit.persist_failed",
                    action = %event.action,
                    resource_id = %event.resource_id,
                    correlation_id = %event.correlation_id,
                    error = %error,
                    "failed to persist audit event"
                );
            }
        });
    }
}

fn audit_from_row(row: SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw = row.try_get::<String, _>("category")?;
    let category = AuditCategory::parse(&category_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit category `{category_raw}`")))?;
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = AuditOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit outcome `{outcome_raw}`")))?;
    let metadata: BTreeMap<String, String> =
        decode_json("metadata_json", &row.try_get::<String, _>("metadata_json")?)?;

    Ok(AuditEvent {
        event_id: row.try_get("id")?,
        action: row.try_get("action")?,
        category,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        correlation_id: row.try_get("correlation_id")?,
        actor: row.try_get("actor")?,
        outcome,
        metadata,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
