use std::collections::HashMap;

use tokio::sync::RwLock;

use exportdesk_core::domain::agent::{AgentEvent, AgentTask, TaskId, TaskStatus};
use exportdesk_core::domain::journey::{DealJourney, JourneyHistoryEntry, JourneyId};
use exportdesk_core::domain::workflow::{WorkflowId, WorkflowInstance};

use super::{
    EventLogRepository, JourneyRepository, RepositoryError, TaskRepository, WorkflowRepository,
};

#[derive(Default)]
pub struct InMemoryJourneyRepository {
    journeys: RwLock<HashMap<String, DealJourney>>,
}

#[async_trait::async_trait]
impl JourneyRepository for InMemoryJourneyRepository {
    async fn insert(&self, journey: &DealJourney) -> Result<(), RepositoryError> {
        let mut journeys = self.journeys.write().await;
        journeys.insert(journey.id.0.clone(), journey.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &JourneyId) -> Result<Option<DealJourney>, RepositoryError> {
        let journeys = self.journeys.read().await;
        Ok(journeys.get(&id.0).cloned())
    }

    async fn save_transition(
        &self,
        journey: &DealJourney,
        expected_version: u32,
        entry: &JourneyHistoryEntry,
    ) -> Result<bool, RepositoryError> {
        let mut journeys = self.journeys.write().await;
        let Some(stored) = journeys.get_mut(&journey.id.0) else {
            return Ok(false);
        };
        if stored.version != expected_version {
            return Ok(false);
        }

        let mut updated = journey.clone();
        updated.history = stored.history.clone();
        updated.history.push(entry.clone());
        *stored = updated;
        Ok(true)
    }

    async fn list_history(
        &self,
        id: &JourneyId,
    ) -> Result<Vec<JourneyHistoryEntry>, RepositoryError> {
        let journeys = self.journeys.read().await;
        Ok(journeys.get(&id.0).map(|journey| journey.history.clone()).unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.0.clone(), instance.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn save_if_version(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.id.0) {
            Some(stored) if stored.version == expected_version => {
                *stored = instance.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_journey(
        &self,
        journey_id: &JourneyId,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        let mut matching = instances
            .values()
            .filter(|instance| instance.journey_id.as_ref() == Some(journey_id))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<String, AgentTask>>,
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: &AgentTask) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.0.clone(), task.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<AgentTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn update_if_status(
        &self,
        task: &AgentTask,
        expected: TaskStatus,
    ) -> Result<bool, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id.0) {
            Some(stored) if stored.status == expected => {
                *stored = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        agent: Option<&str>,
    ) -> Result<Vec<AgentTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut matching = tasks
            .values()
            .filter(|task| task.status == status)
            .filter(|task| agent.map_or(true, |agent| task.target_agent == agent))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryEventLogRepository {
    events: RwLock<Vec<AgentEvent>>,
}

#[async_trait::async_trait]
impl EventLogRepository for InMemoryEventLogRepository {
    async fn append(&self, event: &AgentEvent) -> Result<u64, RepositoryError> {
        let mut events = self.events.write().await;
        let sequence = events.len() as u64 + 1;
        let mut stored = event.clone();
        stored.sequence = Some(sequence);
        events.push(stored);
        Ok(sequence)
    }

    async fn list(
        &self,
        event_type: Option<&str>,
        since_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, RepositoryError> {
        let events = self.events.read().await;
        let since = since_sequence.unwrap_or(0);
        Ok(events
            .iter()
            .filter(|event| event.sequence.is_some_and(|sequence| sequence > since))
            .filter(|event| event_type.map_or(true, |kind| event.event_type == kind))
            .take(limit)
            .cloned()
            .collect())
    }
}
