use async_trait::async_trait;
use thiserror::Error;

use exportdesk_core::domain::agent::{AgentEvent, AgentTask, TaskId, TaskStatus};
use exportdesk_core::domain::journey::{DealJourney, JourneyHistoryEntry, JourneyId};
use exportdesk_core::domain::workflow::{WorkflowId, WorkflowInstance};
use exportdesk_core::errors::ApplicationError;

pub mod audit;
pub mod event_log;
pub mod journey;
pub mod memory;
mod rows;
pub mod task;
pub mod workflow;

pub use audit::SqlAuditSink;
pub use event_log::SqlEventLogRepository;
pub use journey::SqlJourneyRepository;
pub use memory::{
    InMemoryEventLogRepository, InMemoryJourneyRepository, InMemoryTaskRepository,
    InMemoryWorkflowRepository,
};
pub use task::SqlTaskRepository;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

#[async_trait]
pub trait JourneyRepository: Send + Sync {
    async fn insert(&self, journey: &DealJourney) -> Result<(), RepositoryError>;

    /// Loads the journey together with its ordered history.
    async fn find_by_id(&self, id: &JourneyId) -> Result<Option<DealJourney>, RepositoryError>;

    /// Writes the new journey row and appends `entry` in one atomic step, but only when the
    /// stored version still equals `expected_version`. Returns `false` when the write lost a race.
    async fn save_transition(
        &self,
        journey: &DealJourney,
        expected_version: u32,
        entry: &JourneyHistoryEntry,
    ) -> Result<bool, RepositoryError>;

    async fn list_history(
        &self,
        id: &JourneyId,
    ) -> Result<Vec<JourneyHistoryEntry>, RepositoryError>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &WorkflowId)
        -> Result<Option<WorkflowInstance>, RepositoryError>;

    /// Version-checked update. Returns `false` when the stored version moved on.
    async fn save_if_version(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn list_for_journey(
        &self,
        journey_id: &JourneyId,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &AgentTask) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<AgentTask>, RepositoryError>;

    /// Stores `task` only if the stored status still equals `expected`. This is the claim
    /// primitive: two claimants racing on a pending task see exactly one `true`.
    async fn update_if_status(
        &self,
        task: &AgentTask,
        expected: TaskStatus,
    ) -> Result<bool, RepositoryError>;

    /// Oldest first. `agent` narrows to a single target agent.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        agent: Option<&str>,
    ) -> Result<Vec<AgentTask>, RepositoryError>;
}

#[async_trait]
pub trait EventLogRepository: Send + Sync {
    /// Appends the event and returns its assigned sequence number.
    async fn append(&self, event: &AgentEvent) -> Result<u64, RepositoryError>;

    /// Events in sequence order, optionally filtered by type and strictly after `since_sequence`.
    async fn list(
        &self,
        event_type: Option<&str>,
        since_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, RepositoryError>;
}
