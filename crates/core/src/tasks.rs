//! Agent task status engine
//!
//! Pure transition logic for delegated agent tasks. Storage adapters are responsible for
//! making the claim atomic; this module only decides what a valid next task looks like.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::domain::agent::{AgentTask, TaskId, TaskStatus};
use crate::domain::workflow::WorkflowId;
use crate::errors::DomainError;

/// Error label recorded on tasks failed by the stale-claim reaper.
pub const CLAIM_TIMEOUT_ERROR: &str = "claim_timeout";

#[derive(Clone, Debug)]
pub struct TaskEngineConfig {
    /// How long a claim may stay open before the task is considered stale
    pub claim_timeout_seconds: i64,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self { claim_timeout_seconds: 300 }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TaskEngine {
    config: TaskEngineConfig,
}

impl TaskEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TaskEngineConfig) -> Self {
        Self { config }
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::seconds(self.config.claim_timeout_seconds)
    }

    pub fn create_task(
        &self,
        target_agent: impl Into<String>,
        payload: Value,
        workflow_id: Option<WorkflowId>,
        step_index: Option<usize>,
    ) -> AgentTask {
        let now = Utc::now();
        AgentTask {
            id: TaskId::generate(),
            target_agent: target_agent.into(),
            payload,
            status: TaskStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            result: None,
            error: None,
            workflow_id,
            step_index,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending -> Claimed. Unlike retries in a job queue, a claimed task is never stolen:
    /// stale claims are failed by the reaper instead.
    pub fn claim_task(
        &self,
        mut task: AgentTask,
        claimant: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentTask, DomainError> {
        validate_transition(&task, TaskStatus::Claimed)?;

        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(claimant.into());
        task.claimed_at = Some(now);
        task.updated_at = now;
        Ok(task)
    }

    pub fn complete_task(&self, mut task: AgentTask, result: Value) -> Result<AgentTask, DomainError> {
        validate_transition(&task, TaskStatus::Completed)?;

        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.updated_at = Utc::now();
        Ok(task)
    }

    pub fn fail_task(
        &self,
        mut task: AgentTask,
        error: impl Into<String>,
    ) -> Result<AgentTask, DomainError> {
        validate_transition(&task, TaskStatus::Failed)?;

        task.status = TaskStatus::Failed;
        task.error = Some(error.into());
        task.updated_at = Utc::now();
        Ok(task)
    }

    pub fn is_stale(&self, task: &AgentTask, reference_time: DateTime<Utc>) -> bool {
        let stale_threshold = reference_time - self.claim_timeout();
        task.status == TaskStatus::Claimed
            && task.claimed_at.is_some_and(|claimed_at| claimed_at < stale_threshold)
    }

    pub fn find_stale(
        &self,
        tasks: Vec<AgentTask>,
        reference_time: DateTime<Utc>,
    ) -> Vec<AgentTask> {
        tasks.into_iter().filter(|task| self.is_stale(task, reference_time)).collect()
    }
}

fn validate_transition(task: &AgentTask, to: TaskStatus) -> Result<(), DomainError> {
    let valid = matches!(
        (task.status, to),
        (TaskStatus::Pending, TaskStatus::Claimed)
            | (TaskStatus::Claimed, TaskStatus::Completed)
            | (TaskStatus::Claimed, TaskStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidTaskTransition { task_id: task.id.clone(), from: task.status, to })
    }
}
