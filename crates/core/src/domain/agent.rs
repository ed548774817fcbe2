use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::workflow::WorkflowId;

pub mod event_types {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_DISPATCHED: &str = "workflow.step_dispatched";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const JOURNEY_TRANSITIONED: &str = "journey.transitioned";
}

pub mod agent_names {
    pub const MATCHMAKER: &str = "matchmaker";
    pub const NEGOTIATOR: &str = "negotiator";
    pub const PRICING: &str = "pricing";
    pub const LOGISTICS: &str = "logistics";
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Unit of delegated work. At most one agent may hold the claim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: TaskId,
    pub target_agent: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub workflow_id: Option<WorkflowId>,
    pub step_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fire-and-forget notification. `sequence` is assigned by the event log on append.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_type: String,
    pub payload: Value,
    pub published_by: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: Option<u64>,
}

impl AgentEvent {
    pub fn new(
        event_type: impl Into<String>,
        payload: Value,
        published_by: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            published_by: published_by.into(),
            timestamp: Utc::now(),
            sequence: None,
        }
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
