use sqlx::{sqlite::SqliteRow, Row};

use exportdesk_core::domain::agent::TaskId;
use exportdesk_core::domain::journey::JourneyId;
use exportdesk_core::domain::workflow::{StepOutcome, WorkflowId, WorkflowInstance, WorkflowStatus};

use super::rows::{decode_json, encode_json, parse_timestamp, parse_u32, parse_usize, to_i64};
use super::{RepositoryError, WorkflowRepository};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        workflow_name,
        journey_id,
        status,
        current_step_index,
        total_steps,
        context_json,
        current_task_id,
        pending_outcome_json,
        failure_reason,
        version,
        created_at,
        updated_at
     FROM workflow_instance";

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_instance (
                id,
                workflow_name,
                journey_id,
                status,
                current_step_index,
                total_steps,
                context_json,
                current_task_id,
                pending_outcome_json,
                failure_reason,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(&instance.workflow_name)
        .bind(instance.journey_id.as_ref().map(|id| id.0.as_str()))
        .bind(instance.status.as_str())
        .bind(to_i64("current_step_index", instance.current_step_index)?)
        .bind(to_i64("total_steps", instance.total_steps)?)
        .bind(encode_json("context_json", &instance.context)?)
        .bind(instance.current_task_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_pending(&instance.pending_outcome)?)
        .bind(instance.failure_reason.as_deref())
        .bind(i64::from(instance.version))
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(instance_from_row).transpose()
    }

    async fn save_if_version(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE workflow_instance
             SET status = ?,
                 current_step_index = ?,
                 context_json = ?,
                 current_task_id = ?,
                 pending_outcome_json = ?,
                 failure_reason = ?,
                 version = ?,
                 updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(instance.status.as_str())
        .bind(to_i64("current_step_index", instance.current_step_index)?)
        .bind(encode_json("context_json", &instance.context)?)
        .bind(instance.current_task_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_pending(&instance.pending_outcome)?)
        .bind(instance.failure_reason.as_deref())
        .bind(i64::from(instance.version))
        .bind(instance.updated_at.to_rfc3339())
        .bind(&instance.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_for_journey(
        &self,
        journey_id: &JourneyId,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE journey_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(&journey_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(instance_from_row).collect()
    }
}

fn encode_pending(outcome: &Option<StepOutcome>) -> Result<Option<String>, RepositoryError> {
    outcome.as_ref().map(|outcome| encode_json("pending_outcome_json", outcome)).transpose()
}

fn instance_from_row(row: SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = WorkflowStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown workflow status `{status_raw}`")))?;

    let pending_outcome = row
        .try_get::<Option<String>, _>("pending_outcome_json")?
        .map(|raw| decode_json::<StepOutcome>("pending_outcome_json", &raw))
        .transpose()?;

    Ok(WorkflowInstance {
        id: WorkflowId(row.try_get("id")?),
        workflow_name: row.try_get("workflow_name")?,
        journey_id: row.try_get::<Option<String>, _>("journey_id")?.map(JourneyId),
        status,
        current_step_index: parse_usize("current_step_index", row.try_get("current_step_index")?)?,
        total_steps: parse_usize("total_steps", row.try_get("total_steps")?)?,
        context: decode_json("context_json", &row.try_get::<String, _>("context_json")?)?,
        current_task_id: row.try_get::<Option<String>, _>("current_task_id")?.map(TaskId),
        pending_outcome,
        failure_reason: row.try_get("failure_reason")?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
