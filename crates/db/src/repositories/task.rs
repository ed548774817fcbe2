use sqlx::{sqlite::SqliteRow, Row};

use exportdesk_core::domain::agent::{AgentTask, TaskId, TaskStatus};
use exportdesk_core::domain::workflow::WorkflowId;

use super::rows::{decode_json, encode_json, parse_optional_timestamp, parse_timestamp, parse_usize, to_i64};
use super::{RepositoryError, TaskRepository};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        target_agent,
        payload_json,
        status,
        claimed_by,
        claimed_at,
        result_json,
        error,
        workflow_id,
        step_index,
        created_at,
        updated_at
     FROM agent_task";

pub struct SqlTaskRepository {
    pool: DbPool,
}

impl SqlTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TaskRepository for SqlTaskRepository {
    async fn insert(&self, task: &AgentTask) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_task (
                id,
                target_agent,
                payload_json,
                status,
                claimed_by,
                claimed_at,
                result_json,
                error,
                workflow_id,
                step_index,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id.0)
        .bind(&task.target_agent)
        .bind(encode_json("payload_json", &task.payload)?)
        .bind(task.status.as_str())
        .bind(task.claimed_by.as_deref())
        .bind(task.claimed_at.map(|value| value.to_rfc3339()))
        .bind(encode_result(task)?)
        .bind(task.error.as_deref())
        .bind(task.workflow_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_step_index(task)?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<AgentTask>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(task_from_row).transpose()
    }

    async fn update_if_status(
        &self,
        task: &AgentTask,
        expected: TaskStatus,
    ) -> Result<bool, RepositoryError> {
        let updated = sqlx::query(
            "UPDATE agent_task
             SET status = ?,
                 claimed_by = ?,
                 claimed_at = ?,
                 result_json = ?,
                 error = ?,
                 updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(task.status.as_str())
        .bind(task.claimed_by.as_deref())
        .bind(task.claimed_at.map(|value| value.to_rfc3339()))
        .bind(encode_result(task)?)
        .bind(task.error.as_deref())
        .bind(task.updated_at.to_rfc3339())
        .bind(&task.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        agent: Option<&str>,
    ) -> Result<Vec<AgentTask>, RepositoryError> {
        let rows = if let Some(agent) = agent {
            sqlx::query(&format!(
                "{SELECT_COLUMNS} WHERE status = ? AND target_agent = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(status.as_str())
            .bind(agent)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at ASC, id ASC"))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(task_from_row).collect()
    }
}

fn encode_result(task: &AgentTask) -> Result<Option<String>, RepositoryError> {
    task.result.as_ref().map(|result| encode_json("result_json", result)).transpose()
}

fn encode_step_index(task: &AgentTask) -> Result<Option<i64>, RepositoryError> {
    task.step_index.map(|index| to_i64("step_index", index)).transpose()
}

fn task_from_row(row: SqliteRow) -> Result<AgentTask, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown task status `{status_raw}`")))?;

    Ok(AgentTask {
        id: TaskId(row.try_get("id")?),
        target_agent: row.try_get("target_agent")?,
        payload: decode_json("payload_json", &row.try_get::<String, _>("payload_json")?)?,
        status,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        result: row
            .try_get::<Option<String>, _>("result_json")?
            .map(|raw| decode_json("result_json", &raw))
            .transpose()?,
        error: row.try_get("error")?,
        workflow_id: row.try_get::<Option<String>, _>("workflow_id")?.map(WorkflowId),
        step_index: row
            .try_get::<Option<i64>, _>("step_index")?
            .map(|value| parse_usize("step_index", value))
            .transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
