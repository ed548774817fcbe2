//! Agent event bus
//!
//! Two concerns share one façade:
//! - **events**: durable append to the event log, then fan-out to in-process subscribers and
//!   the realtime channel. Publishing never waits for a handler.
//! - **tasks**: the delegated-work queue. A claim is a status-guarded write, so exactly one
//!   agent wins a pending task no matter how many race for it.
//!
//! Task lifecycle changes are themselves published (`task.enqueued`, `task.claimed`,
//! `task.completed`, `task.failed`) so the workflow engine can react to completions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use exportdesk_core::domain::agent::{event_types, AgentEvent, AgentTask, TaskId, TaskStatus};
use exportdesk_core::errors::{ApplicationError, DomainError};
use exportdesk_core::realtime::RealtimeMessage;
use exportdesk_core::tasks::{TaskEngine, CLAIM_TIMEOUT_ERROR};
use exportdesk_db::{EventLogRepository, TaskRepository};

use crate::realtime::{NoopRealtimeChannel, RealtimeChannel};

pub const BUS_PUBLISHER: &str = "agent-bus";
/// Subscribe with this event type to receive every event.
pub const ALL_EVENTS: &str = "*";

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: AgentEvent);
}

pub struct FnHandler<F>(F);

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> FnHandler<F>
where
    F: Fn(AgentEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(handler)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(AgentEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: AgentEvent) {
        (self.0)(event).await;
    }
}

#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: String,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Subscriber {
    event_type: String,
    sender: mpsc::UnboundedSender<AgentEvent>,
    active: Arc<AtomicBool>,
}

impl Subscriber {
    fn matches(&self, event_type: &str) -> bool {
        self.event_type == ALL_EVENTS || self.event_type == event_type
    }
}

pub struct AgentEventBus {
    tasks: Arc<dyn TaskRepository>,
    log: Arc<dyn EventLogRepository>,
    engine: TaskEngine,
    realtime: Arc<dyn RealtimeChannel>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscription: AtomicU64,
}

impl AgentEventBus {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        log: Arc<dyn EventLogRepository>,
        engine: TaskEngine,
    ) -> Self {
        Self {
            tasks,
            log,
            engine,
            realtime: Arc::new(NoopRealtimeChannel),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn with_realtime(mut self, channel: Arc<dyn RealtimeChannel>) -> Self {
        self.realtime = channel;
        self
    }

    pub fn task_engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Appends to the event log, then hands the event to matching subscribers and the
    /// realtime channel. Returns the assigned log sequence.
    pub async fn publish(&self, event: AgentEvent) -> Result<u64, ApplicationError> {
        let sequence = self.log.append(&event).await?;
        let mut event = event;
        event.sequence = Some(sequence);

        let delivered = self.deliver(&event);
        self.push_realtime(&event);

        debug!(
            event_name = "bus.event_published",
            event_type = %event.event_type,
            published_by = %event.published_by,
            sequence,
            delivered,
            "event published"
        );
        Ok(sequence)
    }

    /// Registers `handler` for future events of `event_type` (or [`ALL_EVENTS`]).
    ///
    /// Each subscription owns one queue drained by one task, so a handler sees events in
    /// the order they were published and a slow handler only delays itself. Must be called
    /// from within a tokio runtime.
    pub fn subscribe<H>(&self, event_type: impl Into<String>, handler: H) -> SubscriptionHandle
    where
        H: EventHandler + 'static,
    {
        let event_type = event_type.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<AgentEvent>();
        let active = Arc::new(AtomicBool::new(true));
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let running = Arc::clone(&active);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                handler.handle(event).await;
            }
        });

        self.lock_subscribers().insert(
            id,
            Subscriber { event_type: event_type.clone(), sender, active: Arc::clone(&active) },
        );
        debug!(event_name = "bus.subscribed", subscription_id = id, event_type = %event_type, "subscriber registered");

        SubscriptionHandle { id, event_type, active }
    }

    /// Stops delivery to the subscription. A handler call already running is left to finish.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.active.store(false, Ordering::Release);
        let removed = self.lock_subscribers().remove(&handle.id).is_some();
        if removed {
            debug!(event_name = "bus.unsubscribed", subscription_id = handle.id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    pub async fn list_events(
        &self,
        event_type: Option<&str>,
        since_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AgentEvent>, ApplicationError> {
        Ok(self.log.list(event_type, since_sequence, limit).await?)
    }

    pub async fn enqueue_task(&self, task: AgentTask) -> Result<TaskId, ApplicationError> {
        if task.status != TaskStatus::Pending {
            return Err(DomainError::InvariantViolation(format!(
                "task {} must be pending to enqueue, found {}",
                task.id,
                task.status.as_str()
            ))
            .into());
        }

        self.tasks.insert(&task).await?;
        info!(
            event_name = "task.enqueued",
            task_id = %task.id,
            target_agent = %task.target_agent,
            workflow_id = task.workflow_id.as_ref().map(|id| id.0.as_str()),
            "task enqueued"
        );
        self.announce(event_types::TASK_ENQUEUED, &task).await;
        Ok(task.id)
    }

    /// Returns `None` when the task is missing or another agent already holds it.
    pub async fn claim_task(
        &self,
        task_id: &TaskId,
        claimant: &str,
    ) -> Result<Option<AgentTask>, ApplicationError> {
        let Some(task) = self.tasks.find_by_id(task_id).await? else {
            debug!(event_name = "task.claim_missing", task_id = %task_id, claimant, "claim on unknown task");
            return Ok(None);
        };
        if task.status != TaskStatus::Pending {
            debug!(
                event_name = "task.claim_rejected",
                task_id = %task_id,
                claimant,
                status = task.status.as_str(),
                "task is not pending"
            );
            return Ok(None);
        }

        let claimed = self.engine.claim_task(task, claimant, Utc::now())?;
        if !self.tasks.update_if_status(&claimed, TaskStatus::Pending).await? {
            debug!(event_name = "task.claim_lost", task_id = %task_id, claimant, "claim race lost");
            return Ok(None);
        }

        info!(event_name = "task.claimed", task_id = %task_id, claimant, "task claimed");
        self.announce(event_types::TASK_CLAIMED, &claimed).await;
        Ok(Some(claimed))
    }

    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        result: Value,
    ) -> Result<AgentTask, ApplicationError> {
        let task = self.get_task(task_id).await?;
        let completed = self.engine.complete_task(task, result)?;
        self.commit_from_claimed(&completed).await?;

        info!(event_name = "task.completed", task_id = %task_id, "task completed");
        self.announce(event_types::TASK_COMPLETED, &completed).await;
        Ok(completed)
    }

    pub async fn fail_task(
        &self,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<AgentTask, ApplicationError> {
        let task = self.get_task(task_id).await?;
        let failed = self.engine.fail_task(task, error)?;
        self.commit_from_claimed(&failed).await?;

        warn!(
            event_name = "task.failed",
            task_id = %task_id,
            error = failed.error.as_deref().unwrap_or_default(),
            "task failed"
        );
        self.announce(event_types::TASK_FAILED, &failed).await;
        Ok(failed)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<AgentTask, ApplicationError> {
        self.tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| ApplicationError::TaskNotFound(task_id.clone()))
    }

    pub async fn list_pending_tasks(
        &self,
        target_agent: Option<&str>,
    ) -> Result<Vec<AgentTask>, ApplicationError> {
        Ok(self.tasks.list_by_status(TaskStatus::Pending, target_agent).await?)
    }

    /// Fails every claim older than the configured timeout with `claim_timeout`.
    pub async fn reap_stale_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, ApplicationError> {
        let claimed = self.tasks.list_by_status(TaskStatus::Claimed, None).await?;
        let mut reaped = Vec::new();

        for task in self.engine.find_stale(claimed, now) {
            let failed = self.engine.fail_task(task, CLAIM_TIMEOUT_ERROR)?;
            if !self.tasks.update_if_status(&failed, TaskStatus::Claimed).await? {
                continue;
            }

            warn!(
                event_name = "task.reaped",
                task_id = %failed.id,
                claimed_by = failed.claimed_by.as_deref().unwrap_or_default(),
                "stale claim failed"
            );
            self.announce(event_types::TASK_FAILED, &failed).await;
            reaped.push(failed.id);
        }

        Ok(reaped)
    }

    async fn commit_from_claimed(&self, task: &AgentTask) -> Result<(), ApplicationError> {
        if self.tasks.update_if_status(task, TaskStatus::Claimed).await? {
            return Ok(());
        }

        let current = self.get_task(&task.id).await?;
        Err(DomainError::InvalidTaskTransition {
            task_id: task.id.clone(),
            from: current.status,
            to: task.status,
        }
        .into())
    }

    /// The task change is already committed, so a failed publish is logged rather than
    /// surfaced to the caller.
    async fn announce(&self, event_type: &str, task: &AgentTask) {
        let event = AgentEvent::new(event_type, task_event_payload(task), BUS_PUBLISHER);
        if let Err(error) = self.publish(event).await {
            warn!(
                event_name = "bus.lifecycle_publish_failed",
                event_type,
                task_id = %task.id,
                error = %error,
                "failed to publish task lifecycle event"
            );
        }
    }

    fn deliver(&self, event: &AgentEvent) -> usize {
        let mut subscribers = self.lock_subscribers();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.matches(&event.event_type) || !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            if subscriber.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }

        for id in closed {
            subscribers.remove(&id);
        }
        delivered
    }

    fn push_realtime(&self, event: &AgentEvent) {
        if !self.realtime.is_enabled() {
            return;
        }

        let channel = Arc::clone(&self.realtime);
        let message = RealtimeMessage::from(event);
        tokio::spawn(async move {
            if let Err(error) = channel.push(&message).await {
                warn!(
                    event_name = "bus.realtime_push_failed",
                    channel = channel.name(),
                    event_type = %message.event_type,
                    sequence = message.sequence,
                    error = %error,
                    "realtime delivery failed"
                );
            }
        });
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn task_event_payload(task: &AgentTask) -> Value {
    json!({
        "task_id": task.id.0,
        "target_agent": task.target_agent,
        "status": task.status.as_str(),
        "workflow_id": task.workflow_id.as_ref().map(|id| id.0.as_str()),
        "step_index": task.step_index,
        "claimed_by": task.claimed_by,
        "result": task.result,
        "error": task.error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use exportdesk_core::domain::agent::{event_types, AgentEvent, TaskStatus};
    use exportdesk_core::errors::{ApplicationError, DomainError};
    use exportdesk_core::realtime::RealtimeMessage;
    use exportdesk_core::tasks::{TaskEngine, TaskEngineConfig, CLAIM_TIMEOUT_ERROR};
    use exportdesk_db::repositories::{InMemoryEventLogRepository, InMemoryTaskRepository};

    use super::{handler_fn, AgentEventBus, ALL_EVENTS};
    use crate::realtime::{RealtimeChannel, RealtimeError};

    fn bus_with(engine: TaskEngine) -> AgentEventBus {
        AgentEventBus::new(
            Arc::new(InMemoryTaskRepository::default()),
            Arc::new(InMemoryEventLogRepository::default()),
            engine,
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<AgentEvent>>>, impl Fn(AgentEvent) -> std::future::Ready<()> + Send + Sync + 'static)
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |event: AgentEvent| {
            sink.lock().expect("recorder lock").push(event);
            std::future::ready(())
        };
        (seen, handler)
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<AgentEvent>>>, count: usize) -> Vec<AgentEvent> {
        for _ in 0..100 {
            let events = seen.lock().expect("recorder lock").clone();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen.lock().expect("recorder lock").clone()
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events_in_publish_order() {
        let bus = bus_with(TaskEngine::new());
        let (seen, handler) = recorder();
        bus.subscribe("deal.note", handler_fn(handler));

        for index in 0..5 {
            bus.publish(AgentEvent::new("deal.note", json!({ "index": index }), "negotiator"))
                .await
                .expect("publish");
            bus.publish(AgentEvent::new("deal.other", json!({}), "negotiator"))
                .await
                .expect("publish other");
        }

        let events = wait_for(&seen, 5).await;
        let order = events.iter().map(|event| event.payload["index"].as_i64()).collect::<Vec<_>>();
        assert_eq!(order, (0..5).map(Some).collect::<Vec<_>>());
        assert!(events.iter().all(|event| event.sequence.is_some()));
    }

    struct FailingChannel {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RealtimeChannel for FailingChannel {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn push(&self, _message: &RealtimeMessage) -> Result<(), RealtimeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::Transport("dashboard unreachable".to_owned()))
        }
    }

    #[tokio::test]
    async fn realtime_failure_does_not_affect_publish_or_subscribers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let bus = bus_with(TaskEngine::new())
            .with_realtime(Arc::new(FailingChannel { attempts: Arc::clone(&attempts) }));
        let (seen, handler) = recorder();
        bus.subscribe("deal.note", handler_fn(handler));

        let first = bus
            .publish(AgentEvent::new("deal.note", json!({ "index": 0 }), "negotiator"))
            .await
            .expect("publish despite realtime failure");
        let second = bus
            .publish(AgentEvent::new("deal.note", json!({ "index": 1 }), "negotiator"))
            .await
            .expect("publish despite realtime failure");
        assert!(second > first);

        let events = wait_for(&seen, 2).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, Some(first));

        for _ in 0..100 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(bus.list_events(Some("deal.note"), None, 10).await.expect("log").len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let bus = bus_with(TaskEngine::new());
        let (seen, handler) = recorder();
        let handle = bus.subscribe(ALL_EVENTS, handler_fn(handler));

        bus.publish(AgentEvent::new("deal.note", json!({}), "pricing")).await.expect("publish");
        assert_eq!(wait_for(&seen, 1).await.len(), 1);

        assert!(bus.unsubscribe(&handle));
        assert!(!handle.is_active());
        assert!(!bus.unsubscribe(&handle));
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(AgentEvent::new("deal.note", json!({}), "pricing")).await.expect("publish");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().expect("recorder lock").len(), 1);

        let logged = bus.list_events(Some("deal.note"), None, 10).await.expect("list");
        assert_eq!(logged.len(), 2);
    }

    #[tokio::test]
    async fn task_lifecycle_is_guarded_and_published() {
        let bus = bus_with(TaskEngine::new());
        let task = bus.task_engine().create_task("pricing", json!({ "listing_id": "L-9" }), None, None);
        let task_id = bus.enqueue_task(task).await.expect("enqueue");

        assert_eq!(bus.list_pending_tasks(Some("pricing")).await.expect("pending").len(), 1);
        assert!(bus.list_pending_tasks(Some("matchmaker")).await.expect("other").is_empty());

        let error = bus.complete_task(&task_id, json!({})).await.expect_err("not claimed yet");
        assert!(matches!(
            error,
            ApplicationError::Domain(DomainError::InvalidTaskTransition { from: TaskStatus::Pending, .. })
        ));

        let claimed = bus.claim_task(&task_id, "pricing-1").await.expect("claim").expect("won");
        assert_eq!(claimed.claimed_by.as_deref(), Some("pricing-1"));
        assert!(bus.claim_task(&task_id, "pricing-2").await.expect("reclaim").is_none());

        let completed = bus.complete_task(&task_id, json!({ "price": 18_500 })).await.expect("complete");
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(bus.fail_task(&task_id, "late").await.is_err());

        let kinds = bus
            .list_events(None, None, 10)
            .await
            .expect("events")
            .into_iter()
            .map(|event| event.event_type)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![event_types::TASK_ENQUEUED, event_types::TASK_CLAIMED, event_types::TASK_COMPLETED]
        );
    }

    #[tokio::test]
    async fn claim_on_unknown_task_returns_none() {
        let bus = bus_with(TaskEngine::new());
        let missing = exportdesk_core::domain::agent::TaskId("missing".to_owned());

        assert!(bus.claim_task(&missing, "anyone").await.expect("claim").is_none());
        assert!(matches!(
            bus.get_task(&missing).await,
            Err(ApplicationError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn reaper_fails_only_stale_claims() {
        let bus = bus_with(TaskEngine::with_config(TaskEngineConfig { claim_timeout_seconds: 60 }));
        let stale = bus.task_engine().create_task("logistics", json!({}), None, None);
        let fresh = bus.task_engine().create_task("logistics", json!({}), None, None);
        let stale_id = bus.enqueue_task(stale).await.expect("enqueue stale");
        let fresh_id = bus.enqueue_task(fresh).await.expect("enqueue fresh");
        bus.claim_task(&stale_id, "logistics-1").await.expect("claim").expect("won");
        bus.claim_task(&fresh_id, "logistics-2").await.expect("claim").expect("won");

        let later = Utc::now() + ChronoDuration::seconds(30);
        assert!(bus.reap_stale_tasks(later).await.expect("reap early").is_empty());

        let much_later = Utc::now() + ChronoDuration::seconds(120);
        let reaped = bus.reap_stale_tasks(much_later).await.expect("reap");
        assert_eq!(reaped.len(), 2);

        let task = bus.get_task(&stale_id).await.expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(CLAIM_TIMEOUT_ERROR));
        assert!(bus.reap_stale_tasks(much_later).await.expect("reap again").is_empty());
    }
}
