use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use exportdesk_agent::{
    Agent, AgentEventBus, AgentRegistry, AgentRuntime, GuardedNegotiator, JourneyService,
    NegotiationGuard, SubscriptionHandle, WorkflowEngine,
};
use exportdesk_core::audit::InMemoryAuditSink;
use exportdesk_core::domain::agent::{event_types, AgentTask, TaskId, TaskStatus};
use exportdesk_core::domain::journey::{JourneyId, JourneyState, JourneyTrigger};
use exportdesk_core::domain::workflow::{WorkflowId, WorkflowInstance, WorkflowStatus};
use exportdesk_core::domain::Context;
use exportdesk_core::errors::ApplicationError;
use exportdesk_core::tasks::{TaskEngine, TaskEngineConfig, CLAIM_TIMEOUT_ERROR};
use exportdesk_core::workflows::WorkflowCatalog;
use exportdesk_db::repositories::{
    InMemoryEventLogRepository, InMemoryJourneyRepository, InMemoryTaskRepository,
    InMemoryWorkflowRepository, SqlEventLogRepository, SqlJourneyRepository, SqlTaskRepository,
    SqlWorkflowRepository,
};
use exportdesk_db::{
    connect_in_memory, EventLogRepository, JourneyRepository, RepositoryError, TaskRepository,
    WorkflowRepository,
};

struct Harness {
    journeys: Arc<JourneyService>,
    bus: Arc<AgentEventBus>,
    engine: Arc<WorkflowEngine>,
    audit: InMemoryAuditSink,
    subscriptions: Vec<SubscriptionHandle>,
}

fn assemble(
    journey_repo: Arc<dyn JourneyRepository>,
    workflow_repo: Arc<dyn WorkflowRepository>,
    task_repo: Arc<dyn TaskRepository>,
    event_repo: Arc<dyn EventLogRepository>,
    task_engine: TaskEngine,
) -> Harness {
    let audit = InMemoryAuditSink::default();
    let bus = Arc::new(AgentEventBus::new(task_repo, event_repo, task_engine));
    let journeys = Arc::new(
        JourneyService::new(journey_repo, Arc::new(audit.clone())).with_events(Arc::clone(&bus)),
    );
    let engine = Arc::new(WorkflowEngine::new(
        WorkflowCatalog::builtin(),
        workflow_repo,
        Arc::clone(&journeys),
        Arc::clone(&bus),
    ));
    let subscriptions = engine.attach();

    Harness { journeys, bus, engine, audit, subscriptions }
}

fn memory_harness_with(task_engine: TaskEngine) -> Harness {
    assemble(
        Arc::new(InMemoryJourneyRepository::default()),
        Arc::new(InMemoryWorkflowRepository::default()),
        Arc::new(InMemoryTaskRepository::default()),
        Arc::new(InMemoryEventLogRepository::default()),
        task_engine,
    )
}

fn memory_harness() -> Harness {
    memory_harness_with(TaskEngine::new())
}

async fn sql_harness() -> Harness {
    let pool = connect_in_memory().await.expect("pool");
    assemble(
        Arc::new(SqlJourneyRepository::new(pool.clone())),
        Arc::new(SqlWorkflowRepository::new(pool.clone())),
        Arc::new(SqlTaskRepository::new(pool.clone())),
        Arc::new(SqlEventLogRepository::new(pool)),
        TaskEngine::new(),
    )
}

fn journey_context(journey_id: &JourneyId) -> Context {
    let mut context = Context::new();
    context.insert("journey_id".to_owned(), json!(journey_id.0));
    context.insert("buyer_id".to_owned(), json!("B-100"));
    context.insert("listing_id".to_owned(), json!("L-2040"));
    context
}

async fn status(harness: &Harness, workflow_id: &WorkflowId) -> WorkflowInstance {
    harness
        .engine
        .get_workflow_status(workflow_id)
        .await
        .expect("status")
        .expect("workflow exists")
}

async fn wait_for_workflow(
    harness: &Harness,
    workflow_id: &WorkflowId,
    predicate: impl Fn(&WorkflowInstance) -> bool,
) -> WorkflowInstance {
    let mut last = status(harness, workflow_id).await;
    for _ in 0..300 {
        if predicate(&last) {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        last = status(harness, workflow_id).await;
    }
    panic!("workflow {workflow_id} never reached the expected state: {last:?}");
}

/// Claims and completes whatever task the workflow is currently waiting on.
async fn complete_current_step(harness: &Harness, workflow_id: &WorkflowId, result: Value) -> TaskId {
    let instance = status(harness, workflow_id).await;
    let task_id = instance.current_task_id.expect("step in flight");
    // The instance records the task id just before the task row is enqueued.
    let mut found = harness.bus.get_task(&task_id).await;
    for _ in 0..100 {
        if found.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        found = harness.bus.get_task(&task_id).await;
    }
    let task = found.expect("task");
    harness
        .bus
        .claim_task(&task_id, &task.target_agent)
        .await
        .expect("claim")
        .expect("claim won");
    harness.bus.complete_task(&task_id, result).await.expect("complete");
    task_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_concurrent_claims_wins() {
    for harness in [memory_harness(), sql_harness().await] {
        let task = harness.bus.task_engine().create_task("matchmaker", json!({}), None, None);
        let task_id = harness.bus.enqueue_task(task).await.expect("enqueue");

        let mut claims = Vec::new();
        for worker in 0..16 {
            let bus = Arc::clone(&harness.bus);
            let task_id = task_id.clone();
            claims.push(tokio::spawn(async move {
                bus.claim_task(&task_id, &format!("matchmaker-{worker}")).await.expect("claim")
            }));
        }

        let mut winners = Vec::new();
        for claim in claims {
            if let Some(task) = claim.await.expect("join") {
                winners.push(task);
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = harness.bus.get_task(&task_id).await.expect("task");
        assert_eq!(stored.status, TaskStatus::Claimed);
        assert_eq!(stored.claimed_by, winners[0].claimed_by);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_agents_racing_for_one_task() {
    let harness = sql_harness().await;
    let task = harness.bus.task_engine().create_task("negotiator", json!({}), None, None);
    let task_id = harness.bus.enqueue_task(task).await.expect("enqueue");

    let (first, second) = tokio::join!(
        harness.bus.claim_task(&task_id, "agentA"),
        harness.bus.claim_task(&task_id, "agentB"),
    );
    let outcomes = [first.expect("claim a"), second.expect("claim b")];

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_some()).count(), 1);
    let winner = outcomes.iter().flatten().next().expect("one winner");
    assert_eq!(winner.status, TaskStatus::Claimed);
    assert!(matches!(winner.claimed_by.as_deref(), Some("agentA") | Some("agentB")));
}

#[tokio::test]
async fn repeated_match_found_is_an_invalid_transition() {
    let harness = sql_harness().await;
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");

    let updated = harness
        .journeys
        .transition(&journey.id, JourneyTrigger::MatchFound, "matchmaker", None)
        .await
        .expect("first match_found");
    assert_eq!(updated.current_state, JourneyState::Negotiating);
    assert_eq!(harness.journeys.get_history(&journey.id).await.expect("history").len(), 1);

    let error = harness
        .journeys
        .transition(&journey.id, JourneyTrigger::MatchFound, "matchmaker", None)
        .await
        .expect_err("not declared from negotiating");
    assert!(error.is_invalid_transition());
    assert_eq!(harness.journeys.get_history(&journey.id).await.expect("history").len(), 1);

    let transitioned = harness
        .bus
        .list_events(Some(event_types::JOURNEY_TRANSITIONED), None, 10)
        .await
        .expect("events");
    assert_eq!(transitioned.len(), 1);
    assert_eq!(transitioned[0].payload_str("to"), Some("negotiating"));
}

#[tokio::test]
async fn terminal_journeys_reject_every_trigger() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    harness
        .journeys
        .transition(&journey.id, JourneyTrigger::BuyerCancelled, "buyer", None)
        .await
        .expect("cancel");

    for trigger in [
        JourneyTrigger::StartMatching,
        JourneyTrigger::MatchFound,
        JourneyTrigger::OfferAccepted,
        JourneyTrigger::BuyerCancelled,
        JourneyTrigger::ForceFail,
    ] {
        let error = harness
            .journeys
            .transition(&journey.id, trigger, "ops", None)
            .await
            .expect_err("terminal journey");
        assert!(error.is_invalid_transition(), "{trigger} should be rejected");
    }

    let stored = harness.journeys.get_journey(&journey.id).await.expect("journey");
    assert_eq!(stored.current_state, JourneyState::Cancelled);
    assert_eq!(stored.history.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_keep_history_consistent() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    harness
        .journeys
        .transition(&journey.id, JourneyTrigger::MatchFound, "matchmaker", None)
        .await
        .expect("match");

    let mut attempts = Vec::new();
    for actor in 0..8 {
        let journeys = Arc::clone(&harness.journeys);
        let journey_id = journey.id.clone();
        attempts.push(tokio::spawn(async move {
            journeys
                .transition(&journey_id, JourneyTrigger::OfferAccepted, &format!("negotiator-{actor}"), None)
                .await
        }));
    }

    let mut applied = 0;
    for attempt in attempts {
        match attempt.await.expect("join") {
            Ok(_) => applied += 1,
            Err(error) => assert!(
                error.is_invalid_transition() || error.is_concurrent_modification(),
                "unexpected error: {error}"
            ),
        }
    }

    assert_eq!(applied, 1);
    let history = harness.journeys.get_history(&journey.id).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(
        harness.journeys.verify_history(&journey.id).await.expect("replay"),
        JourneyState::OfferAccepted
    );
}

#[tokio::test]
async fn pause_and_resume_before_first_step_completes() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    let started = status(&harness, &workflow_id).await;
    let first_task = started.current_task_id.clone().expect("step 0 dispatched");

    let paused = harness.engine.pause_workflow(&workflow_id).await.expect("pause");
    assert_eq!(paused.status, WorkflowStatus::Paused);

    let resumed = harness.engine.resume_workflow(&workflow_id).await.expect("resume");
    assert_eq!(resumed.status, WorkflowStatus::Running);
    assert_eq!(resumed.current_step_index, 0);
    assert_eq!(resumed.current_task_id, Some(first_task.clone()));

    let completed = complete_current_step(&harness, &workflow_id, json!({ "listing_id": "L-2040" })).await;
    assert_eq!(completed, first_task);

    let advanced = wait_for_workflow(&harness, &workflow_id, |instance| instance.current_step_index == 1).await;
    assert_eq!(advanced.status, WorkflowStatus::Running);
    assert_eq!(advanced.context["find_matches"], json!({ "listing_id": "L-2040" }));

    let journey = harness.journeys.get_journey(&journey.id).await.expect("journey");
    assert_eq!(journey.current_state, JourneyState::Negotiating);
    assert_eq!(journey.history[0].actor_agent, "matchmaker");

    let negotiator_tasks = harness.bus.list_pending_tasks(Some("negotiator")).await.expect("pending");
    assert_eq!(negotiator_tasks.len(), 1);
    assert_eq!(negotiator_tasks[0].payload["action"], json!("negotiate"));
}

#[tokio::test]
async fn pause_holds_progress_until_resume() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    complete_current_step(&harness, &workflow_id, json!({ "matches": 1 })).await;
    wait_for_workflow(&harness, &workflow_id, |instance| {
        instance.current_step_index == 1 && instance.current_task_id.is_some()
    })
    .await;

    harness.engine.pause_workflow(&workflow_id).await.expect("pause");
    complete_current_step(&harness, &workflow_id, json!({ "price": 20_500 })).await;

    let buffered = wait_for_workflow(&harness, &workflow_id, |instance| instance.pending_outcome.is_some()).await;
    assert_eq!(buffered.status, WorkflowStatus::Paused);
    assert_eq!(buffered.current_step_index, 1);
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::Negotiating
    );

    let resumed = harness.engine.resume_workflow(&workflow_id).await.expect("resume");
    assert_eq!(resumed.status, WorkflowStatus::Running);
    assert_eq!(resumed.current_step_index, 2);
    assert!(resumed.pending_outcome.is_none());
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::OfferAccepted
    );

    let matchmaker_tasks = harness
        .bus
        .list_events(Some(event_types::TASK_ENQUEUED), None, 100)
        .await
        .expect("events")
        .into_iter()
        .filter(|event| event.payload_str("target_agent") == Some("matchmaker"))
        .count();
    assert_eq!(matchmaker_tasks, 1, "completed steps must not run again");
}

#[tokio::test]
async fn failed_step_fails_workflow_and_journey() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    let task_id = status(&harness, &workflow_id).await.current_task_id.expect("task");
    harness.bus.claim_task(&task_id, "matchmaker-1").await.expect("claim").expect("won");
    harness.bus.fail_task(&task_id, "inventory service unavailable").await.expect("fail");

    let failed = wait_for_workflow(&harness, &workflow_id, |instance| instance.status == WorkflowStatus::Failed).await;
    assert!(failed
        .failure_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("inventory service unavailable")));

    let journey = harness.journeys.get_journey(&journey.id).await.expect("journey");
    assert_eq!(journey.current_state, JourneyState::Failed);
    assert_eq!(journey.history.last().map(|entry| entry.trigger), Some(JourneyTrigger::ForceFail));
    assert_eq!(journey.history.last().map(|entry| entry.actor_agent.as_str()), Some("workflow-engine"));
}

#[tokio::test]
async fn rejected_completion_trigger_fails_only_the_workflow() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    harness
        .journeys
        .transition(&journey.id, JourneyTrigger::BuyerCancelled, "buyer", None)
        .await
        .expect("buyer cancels");
    complete_current_step(&harness, &workflow_id, json!({ "matches": 3 })).await;

    let failed = wait_for_workflow(&harness, &workflow_id, |instance| instance.status == WorkflowStatus::Failed).await;
    assert_eq!(failed.current_step_index, 0);
    assert!(failed.failure_reason.as_deref().is_some_and(|reason| reason.contains("find_matches")));
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::Cancelled
    );
}

#[tokio::test]
async fn stale_claim_reaping_fails_the_owning_workflow() {
    let harness = memory_harness_with(TaskEngine::with_config(TaskEngineConfig { claim_timeout_seconds: 60 }));
    let mut context = Context::new();
    context.insert("listing_id".to_owned(), json!("L-77"));
    let workflow_id = harness.engine.start_workflow("price_review", context).await.expect("start");

    let task_id = status(&harness, &workflow_id).await.current_task_id.expect("task");
    harness.bus.claim_task(&task_id, "pricing-1").await.expect("claim").expect("won");

    let reaped = harness
        .bus
        .reap_stale_tasks(Utc::now() + ChronoDuration::seconds(120))
        .await
        .expect("reap");
    assert_eq!(reaped, vec![task_id]);

    let failed = wait_for_workflow(&harness, &workflow_id, |instance| instance.status == WorkflowStatus::Failed).await;
    assert!(failed.failure_reason.as_deref().is_some_and(|reason| reason.contains(CLAIM_TIMEOUT_ERROR)));
    assert!(failed.journey_id.is_none());
}

#[tokio::test]
async fn start_workflow_validates_name_context_and_journey() {
    let harness = memory_harness();

    assert!(matches!(
        harness.engine.start_workflow("auction", Context::new()).await,
        Err(ApplicationError::UnknownWorkflow(name)) if name == "auction"
    ));
    assert!(matches!(
        harness.engine.start_workflow("deal_pipeline", Context::new()).await,
        Err(ApplicationError::InvalidWorkflowContext { .. })
    ));
    assert!(matches!(
        harness
            .engine
            .start_workflow("shipping", journey_context(&JourneyId("J-unknown".to_owned())))
            .await,
        Err(ApplicationError::JourneyNotFound(_))
    ));
    assert!(matches!(
        harness.engine.get_workflow_status(&WorkflowId("missing".to_owned())).await,
        Ok(None)
    ));
    assert!(matches!(
        harness.engine.pause_workflow(&WorkflowId("missing".to_owned())).await,
        Err(ApplicationError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn force_fail_cascades_and_journey_lists_its_workflows() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let first = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start pipeline");
    let second = harness
        .engine
        .start_workflow("shipping", journey_context(&journey.id))
        .await
        .expect("start shipping");

    let listed = harness.engine.get_journey_workflows(&journey.id).await.expect("list");
    let mut ids = listed.iter().map(|instance| instance.id.clone()).collect::<Vec<_>>();
    ids.sort_by(|left, right| left.0.cmp(&right.0));
    let mut expected = vec![first.clone(), second.clone()];
    expected.sort_by(|left, right| left.0.cmp(&right.0));
    assert_eq!(ids, expected);

    harness.engine.pause_workflow(&first).await.expect("pause");
    let failed = harness.engine.force_fail_workflow(&first, "operator abort").await.expect("force fail");
    assert_eq!(failed.status, WorkflowStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("operator abort"));
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::Failed
    );

    assert!(harness.engine.resume_workflow(&first).await.is_err());
    assert!(harness.engine.force_fail_workflow(&first, "again").await.is_err());

    // The sibling workflow fails on its own once its step completes against a failed journey.
    complete_current_step(&harness, &second, json!({ "vessel": "MV Aurora" })).await;
    let sibling = wait_for_workflow(&harness, &second, |instance| instance.status == WorkflowStatus::Failed).await;
    assert_eq!(sibling.current_step_index, 0);
}

struct ScriptedAgent {
    name: &'static str,
    result: Value,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _task: &AgentTask) -> Result<Value> {
        Ok(self.result.clone())
    }
}

fn deal_registry(draft: &str) -> AgentRegistry {
    let mut registry = AgentRegistry::default();
    registry.register(ScriptedAgent { name: "matchmaker", result: json!({ "listing_id": "L-2040" }) });
    registry.register(GuardedNegotiator::new(
        ScriptedAgent { name: "negotiator", result: json!({ "draft": draft, "agreed_price": 20_000 }) },
        NegotiationGuard::default(),
    ));
    registry.register(ScriptedAgent { name: "pricing", result: json!({ "checkout_url": "/checkout/abc" }) });
    registry
}

async fn run_until_terminal(harness: &Harness, runtime: &AgentRuntime, workflow_id: &WorkflowId) -> WorkflowInstance {
    let mut finished = status(harness, workflow_id).await;
    for _ in 0..50 {
        runtime.run_once().await.expect("round");
        finished = status(harness, workflow_id).await;
        if finished.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    finished
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_drives_a_deal_pipeline_to_checkout() {
    let harness = sql_harness().await;
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    let draft = "We agree on 20,000 USD. The car ships from Yokohama next week.";
    let runtime = AgentRuntime::new(Arc::clone(&harness.bus), deal_registry(draft), "test-worker");
    let finished = run_until_terminal(&harness, &runtime, &workflow_id).await;

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.current_step_index, 3);
    assert_eq!(finished.context["negotiate_terms"]["sendable"], json!(true));
    assert_eq!(finished.context["negotiate_terms"]["draft"], json!(draft));

    let journey = harness.journeys.get_journey(&journey.id).await.expect("journey");
    assert_eq!(journey.current_state, JourneyState::PaymentPending);
    assert_eq!(
        harness.journeys.verify_history(&journey.id).await.expect("replay"),
        JourneyState::PaymentPending
    );
    assert!(harness
        .audit
        .events()
        .iter()
        .any(|event| event.action == "journey.transition_applied" && event.actor == "pricing"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_negotiator_draft_never_reaches_offer_accepted() {
    let harness = memory_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    let draft = "Please pay via Western Union, the car is in perfect condition.";
    let runtime = AgentRuntime::new(Arc::clone(&harness.bus), deal_registry(draft), "test-worker");
    let finished = run_until_terminal(&harness, &runtime, &workflow_id).await;

    assert_eq!(finished.status, WorkflowStatus::Failed);
    assert_eq!(finished.current_step_index, 1);
    assert!(finished.context.get("negotiate_terms").is_none());
    assert!(finished
        .failure_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("negotiator draft blocked: payment_scam, false_condition")));

    let journey = harness.journeys.get_journey(&journey.id).await.expect("journey");
    assert_eq!(journey.current_state, JourneyState::Failed);
    assert!(journey.history.iter().all(|entry| entry.to_state != JourneyState::OfferAccepted));
    assert!(harness.bus.list_pending_tasks(Some("pricing")).await.expect("pending").is_empty());
}

/// Task store whose inserts can be switched off to simulate an unavailable queue.
#[derive(Default)]
struct FlakyTaskRepository {
    inner: InMemoryTaskRepository,
    reject_inserts: AtomicBool,
}

impl FlakyTaskRepository {
    fn set_rejecting(&self, rejecting: bool) {
        self.reject_inserts.store(rejecting, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRepository for FlakyTaskRepository {
    async fn insert(&self, task: &AgentTask) -> Result<(), RepositoryError> {
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(RepositoryError::Encode("task queue unavailable".to_owned()));
        }
        self.inner.insert(task).await
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<AgentTask>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn update_if_status(
        &self,
        task: &AgentTask,
        expected: TaskStatus,
    ) -> Result<bool, RepositoryError> {
        self.inner.update_if_status(task, expected).await
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        agent: Option<&str>,
    ) -> Result<Vec<AgentTask>, RepositoryError> {
        self.inner.list_by_status(status, agent).await
    }
}

fn flaky_harness() -> (Harness, Arc<FlakyTaskRepository>) {
    let tasks = Arc::new(FlakyTaskRepository::default());
    let harness = assemble(
        Arc::new(InMemoryJourneyRepository::default()),
        Arc::new(InMemoryWorkflowRepository::default()),
        Arc::clone(&tasks) as Arc<dyn TaskRepository>,
        Arc::new(InMemoryEventLogRepository::default()),
        TaskEngine::new(),
    );
    (harness, tasks)
}

#[tokio::test]
async fn failed_first_enqueue_does_not_leave_a_running_workflow() {
    let (harness, tasks) = flaky_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    tasks.set_rejecting(true);

    let error = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect_err("queue is down");
    assert!(matches!(error, ApplicationError::Persistence(_)));

    let stored = harness.engine.get_journey_workflows(&journey.id).await.expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, WorkflowStatus::Failed);
    assert!(stored[0].current_task_id.is_none());
    assert!(stored[0].failure_reason.as_deref().is_some_and(|reason| reason.contains("dispatch failed")));
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::InquiryReceived
    );
}

#[tokio::test]
async fn step_lost_to_a_failed_enqueue_is_dispatched_again_on_resume() {
    let (harness, tasks) = flaky_harness();
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    tasks.set_rejecting(true);
    complete_current_step(&harness, &workflow_id, json!({ "matches": 2 })).await;
    let stalled = wait_for_workflow(&harness, &workflow_id, |instance| {
        instance.current_step_index == 1 && instance.current_task_id.is_none()
    })
    .await;
    assert_eq!(stalled.status, WorkflowStatus::Running);

    tasks.set_rejecting(false);
    harness.engine.pause_workflow(&workflow_id).await.expect("pause");
    let resumed = harness.engine.resume_workflow(&workflow_id).await.expect("resume");

    assert_eq!(resumed.status, WorkflowStatus::Running);
    assert_eq!(resumed.current_step_index, 1);
    let task_id = resumed.current_task_id.expect("step 1 dispatched again");
    let task = harness.bus.get_task(&task_id).await.expect("task enqueued");
    assert_eq!(task.target_agent, "negotiator");
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn reconcile_replays_a_completion_no_listener_applied() {
    let harness = memory_harness();
    for handle in &harness.subscriptions {
        harness.bus.unsubscribe(handle);
    }
    let journey = harness.journeys.create_journey(Context::new()).await.expect("create");
    let workflow_id = harness
        .engine
        .start_workflow("deal_pipeline", journey_context(&journey.id))
        .await
        .expect("start");

    complete_current_step(&harness, &workflow_id, json!({ "matches": 4 })).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(status(&harness, &workflow_id).await.current_step_index, 0);

    let reconciled = harness.engine.reconcile_workflow(&workflow_id).await.expect("reconcile");
    assert_eq!(reconciled.current_step_index, 1);
    assert_eq!(reconciled.context["find_matches"], json!({ "matches": 4 }));
    assert!(reconciled.current_task_id.is_some());
    assert_eq!(
        harness.journeys.get_journey(&journey.id).await.expect("journey").current_state,
        JourneyState::Negotiating
    );

    let again = harness.engine.reconcile_workflow(&workflow_id).await.expect("idempotent");
    assert_eq!(again.current_step_index, 1);
    assert_eq!(again.current_task_id, reconciled.current_task_id);
}
