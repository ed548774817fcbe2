//! Workflow engine
//!
//! Runs catalog workflows as a chain of suspensions: dispatch a step as an agent task,
//! persist, and wait for the matching `task.completed` / `task.failed` event to advance.
//! Every instance write is version-checked; a lost race re-reads and re-decides.
//!
//! Failure policy: a failed step fails the instance and cascades `force_fail` to the attached
//! journey. A journey that rejects a step's completion trigger fails the instance without
//! touching the journey, whose state is already authoritative.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use exportdesk_core::domain::agent::{event_types, AgentEvent, AgentTask, TaskId, TaskStatus};
use exportdesk_core::domain::journey::{JourneyId, JourneyTrigger};
use exportdesk_core::domain::workflow::{StepOutcome, WorkflowId, WorkflowInstance, WorkflowStatus};
use exportdesk_core::domain::Context;
use exportdesk_core::errors::{ApplicationError, DomainError};
use exportdesk_core::workflows::{
    SignalDisposition, StepDescriptor, WorkflowCatalog, WorkflowDefinition, JOURNEY_ID_KEY,
};
use exportdesk_db::WorkflowRepository;

use crate::bus::{handler_fn, AgentEventBus, SubscriptionHandle};
use crate::journey::{JourneyService, DEFAULT_MAX_TRANSITION_ATTEMPTS};

pub const WORKFLOW_PUBLISHER: &str = "workflow-engine";

pub struct WorkflowEngine {
    catalog: WorkflowCatalog,
    workflows: Arc<dyn WorkflowRepository>,
    journeys: Arc<JourneyService>,
    bus: Arc<AgentEventBus>,
    max_attempts: u32,
}

impl WorkflowEngine {
    pub fn new(
        catalog: WorkflowCatalog,
        workflows: Arc<dyn WorkflowRepository>,
        journeys: Arc<JourneyService>,
        bus: Arc<AgentEventBus>,
    ) -> Self {
        Self { catalog, workflows, journeys, bus, max_attempts: DEFAULT_MAX_TRANSITION_ATTEMPTS }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    /// Advances instances from task completion events. The handlers hold a weak reference,
    /// so dropping the engine ends them.
    pub fn attach(self: &Arc<Self>) -> Vec<SubscriptionHandle> {
        [event_types::TASK_COMPLETED, event_types::TASK_FAILED]
            .into_iter()
            .map(|event_type| {
                let engine = Arc::downgrade(self);
                self.bus.subscribe(
                    event_type,
                    handler_fn(move |event: AgentEvent| {
                        let engine = engine.clone();
                        async move {
                            let Some(engine) = engine.upgrade() else {
                                return;
                            };
                            let Err(error) = engine.handle_task_event(&event).await else {
                                return;
                            };
                            warn!(
                                event_name = "workflow.signal_failed",
                                event_type = %event.event_type,
                                task_id = event.payload_str("task_id").unwrap_or_default(),
                                error = %error,
                                "failed to apply task signal"
                            );
                            // The task row keeps the outcome, so a lost race can be replayed from it.
                            if error.is_concurrent_modification() {
                                if let Some(workflow_id) = event.payload_str("workflow_id") {
                                    let workflow_id = WorkflowId(workflow_id.to_owned());
                                    if let Err(error) = engine.reconcile_workflow(&workflow_id).await {
                                        warn!(
                                            event_name = "workflow.reconcile_failed",
                                            workflow_id = %workflow_id,
                                            error = %error,
                                            "failed to replay task outcome"
                                        );
                                    }
                                }
                            }
                        }
                    }),
                )
            })
            .collect()
    }

    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        context: Context,
    ) -> Result<WorkflowId, ApplicationError> {
        let definition = self.definition(workflow_name)?;
        definition.validate_context(&context).map_err(|message| {
            ApplicationError::InvalidWorkflowContext { workflow: workflow_name.to_owned(), message }
        })?;

        let journey_id = journey_id_from(workflow_name, &context)?;
        if let Some(journey_id) = &journey_id {
            let journey = self.journeys.get_journey(journey_id).await?;
            if journey.is_terminal() {
                return Err(ApplicationError::InvalidWorkflowContext {
                    workflow: workflow_name.to_owned(),
                    message: format!("journey {journey_id} is already {}", journey.current_state),
                });
            }
        }

        let instance = WorkflowInstance::start(definition, journey_id, context);
        self.workflows.insert(&instance).await?;
        info!(
            event_name = "workflow.started",
            workflow_id = %instance.id,
            workflow_name,
            journey_id = instance.journey_id.as_ref().map(|id| id.0.as_str()),
            "workflow started"
        );
        self.announce(event_types::WORKFLOW_STARTED, &instance, json!({})).await;

        let workflow_id = instance.id.clone();
        if instance.status == WorkflowStatus::Completed {
            self.announce(event_types::WORKFLOW_COMPLETED, &instance, json!({})).await;
        } else if let Err(error) = self.dispatch_current_step(definition, instance).await {
            let reason = format!("step dispatch failed: {error}");
            if let Err(fail_error) = self.fail_instance(&workflow_id, &reason).await {
                warn!(
                    event_name = "workflow.abandon_failed",
                    workflow_id = %workflow_id,
                    error = %fail_error,
                    "could not fail workflow after dispatch error"
                );
            }
            return Err(error);
        }
        Ok(workflow_id)
    }

    pub async fn get_workflow_status(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowInstance>, ApplicationError> {
        Ok(self.workflows.find_by_id(workflow_id).await?)
    }

    pub async fn get_journey_workflows(
        &self,
        journey_id: &JourneyId,
    ) -> Result<Vec<WorkflowInstance>, ApplicationError> {
        Ok(self.workflows.list_for_journey(journey_id).await?)
    }

    pub async fn pause_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let (instance, ()) = self.update(workflow_id, |instance| Ok(instance.pause()?)).await?;

        info!(
            event_name = "workflow.paused",
            workflow_id = %workflow_id,
            step_index = instance.current_step_index,
            "workflow paused"
        );
        self.announce(event_types::WORKFLOW_PAUSED, &instance, json!({})).await;
        Ok(instance)
    }

    /// Applies a signal buffered while paused, or re-dispatches a step that never got a task.
    pub async fn resume_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let (instance, buffered) =
            self.update(workflow_id, |instance| Ok(instance.resume()?)).await?;

        info!(
            event_name = "workflow.resumed",
            workflow_id = %workflow_id,
            step_index = instance.current_step_index,
            buffered = buffered.is_some(),
            "workflow resumed"
        );
        self.announce(event_types::WORKFLOW_RESUMED, &instance, json!({})).await;

        match buffered {
            Some(outcome) => self.handle_step_outcome(workflow_id, outcome).await,
            None => self.reconcile_workflow(workflow_id).await,
        }
    }

    /// Re-derives progress for a running instance from its in-flight task: replays a finished
    /// task's outcome, re-dispatches a step whose task never reached the queue, and dispatches
    /// a step with no task at all.
    pub async fn reconcile_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let instance = self.load(workflow_id).await?;
        if instance.status != WorkflowStatus::Running {
            return Ok(instance);
        }
        let definition = self.definition(&instance.workflow_name)?;
        let Some(task_id) = instance.current_task_id.clone() else {
            return self.dispatch_current_step(definition, instance).await;
        };

        let task = match self.bus.get_task(&task_id).await {
            Ok(task) => task,
            Err(ApplicationError::TaskNotFound(_)) => {
                self.release_dispatch(workflow_id, &task_id).await?;
                let instance = self.load(workflow_id).await?;
                return self.dispatch_current_step(definition, instance).await;
            }
            Err(error) => return Err(error),
        };

        match finished_outcome(&task) {
            Some(outcome) => {
                info!(
                    event_name = "workflow.outcome_replayed",
                    workflow_id = %workflow_id,
                    task_id = %task_id,
                    "replaying finished task outcome"
                );
                self.handle_step_outcome(workflow_id, outcome).await
            }
            None => Ok(instance),
        }
    }

    /// Fails a running or paused instance from outside and cascades to its journey.
    pub async fn force_fail_workflow(
        &self,
        workflow_id: &WorkflowId,
        reason: &str,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let instance = self.fail_instance(workflow_id, reason).await?;
        self.cascade_force_fail(&instance, reason).await;
        Ok(instance)
    }

    /// Translates a task lifecycle event into a step signal. Events for tasks that do not
    /// belong to a workflow are skipped.
    pub async fn handle_task_event(
        &self,
        event: &AgentEvent,
    ) -> Result<Option<WorkflowInstance>, ApplicationError> {
        let Some((workflow_id, outcome)) = step_signal(event) else {
            return Ok(None);
        };
        self.handle_step_outcome(&workflow_id, outcome).await.map(Some)
    }

    pub async fn handle_step_outcome(
        &self,
        workflow_id: &WorkflowId,
        outcome: StepOutcome,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let mut attempt = 1;
        loop {
            let instance = self.load(workflow_id).await?;
            let definition = self.definition(&instance.workflow_name)?;
            let expected_version = instance.version;
            let mut next = instance.clone();

            match next.classify_signal(outcome.clone()) {
                SignalDisposition::Ignored => {
                    debug!(
                        event_name = "workflow.signal_ignored",
                        workflow_id = %workflow_id,
                        task_id = %outcome.task_id(),
                        status = %instance.status,
                        "stale or duplicate step signal"
                    );
                    return Ok(instance);
                }
                SignalDisposition::Buffered => {
                    if self.workflows.save_if_version(&next, expected_version).await? {
                        info!(
                            event_name = "workflow.signal_buffered",
                            workflow_id = %workflow_id,
                            task_id = %outcome.task_id(),
                            "step signal held until resume"
                        );
                        return Ok(next);
                    }
                }
                SignalDisposition::Apply(outcome) => {
                    if let Some(applied) =
                        self.apply_outcome(definition, next, expected_version, outcome).await?
                    {
                        return Ok(applied);
                    }
                }
            }

            if attempt >= self.max_attempts {
                return Err(conflict(workflow_id, expected_version));
            }
            attempt += 1;
        }
    }

    /// `Ok(None)` means the version check lost and the caller should re-read.
    async fn apply_outcome(
        &self,
        definition: &WorkflowDefinition,
        mut instance: WorkflowInstance,
        expected_version: u32,
        outcome: StepOutcome,
    ) -> Result<Option<WorkflowInstance>, ApplicationError> {
        let step_index = instance.current_step_index;
        let step = definition.step(step_index).ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "workflow {} has no step at index {step_index}",
                instance.id
            ))
        })?;

        match outcome {
            StepOutcome::Completed { result, .. } => {
                if let Some(rejection) = self.precheck_trigger(&instance, step).await? {
                    let reason = format!("journey rejected `{}`: {rejection}", step.name);
                    return self.fail_instance(&instance.id, &reason).await.map(Some);
                }

                instance.advance(step.name, result.clone())?;
                if !self.workflows.save_if_version(&instance, expected_version).await? {
                    return Ok(None);
                }
                info!(
                    event_name = "workflow.step_completed",
                    workflow_id = %instance.id,
                    step = step.name,
                    step_index,
                    "workflow step completed"
                );

                if let Some(rejection) = self.apply_completion_trigger(&instance, step, result).await {
                    if !instance.status.is_terminal() {
                        let reason = format!("journey rejected `{}`: {rejection}", step.name);
                        return self.fail_instance(&instance.id, &reason).await.map(Some);
                    }
                    warn!(
                        event_name = "workflow.journey_diverged",
                        workflow_id = %instance.id,
                        step = step.name,
                        error = %rejection,
                        "final step completed but journey refused its trigger"
                    );
                }

                if instance.status == WorkflowStatus::Completed {
                    info!(event_name = "workflow.completed", workflow_id = %instance.id, "workflow completed");
                    self.announce(event_types::WORKFLOW_COMPLETED, &instance, json!({})).await;
                    return Ok(Some(instance));
                }
                self.dispatch_current_step(definition, instance).await.map(Some)
            }
            StepOutcome::Failed { error, .. } => {
                let reason = ApplicationError::StepExecutionFailure {
                    workflow_id: instance.id.clone(),
                    step_index,
                    reason: error,
                }
                .to_string();
                instance.fail(reason.clone())?;
                if !self.workflows.save_if_version(&instance, expected_version).await? {
                    return Ok(None);
                }

                warn!(
                    event_name = "workflow.failed",
                    workflow_id = %instance.id,
                    step = step.name,
                    step_index,
                    reason = %reason,
                    "workflow step failed"
                );
                self.announce(event_types::WORKFLOW_FAILED, &instance, json!({ "reason": reason }))
                    .await;
                self.cascade_force_fail(&instance, &reason).await;
                Ok(Some(instance))
            }
        }
    }

    /// Checks the step's completion trigger against the journey's current state before the
    /// instance advances. `Some` carries the rejection.
    async fn precheck_trigger(
        &self,
        instance: &WorkflowInstance,
        step: &StepDescriptor,
    ) -> Result<Option<ApplicationError>, ApplicationError> {
        let (Some(trigger), Some(journey_id)) = (step.completion_trigger, &instance.journey_id)
        else {
            return Ok(None);
        };

        match self.journeys.check_transition(journey_id, trigger).await {
            Ok(_) => Ok(None),
            Err(error) if error.is_invalid_transition() => Ok(Some(error)),
            Err(ApplicationError::JourneyNotFound(id)) => Ok(Some(ApplicationError::JourneyNotFound(id))),
            Err(error) => Err(error),
        }
    }

    /// Returns the journey's error when it refuses the step's completion trigger.
    async fn apply_completion_trigger(
        &self,
        instance: &WorkflowInstance,
        step: &StepDescriptor,
        result: Value,
    ) -> Option<ApplicationError> {
        let (Some(trigger), Some(journey_id)) = (step.completion_trigger, &instance.journey_id)
        else {
            return None;
        };

        let mut patch = Context::new();
        patch.insert(step.name.to_owned(), result);
        match self.journeys.transition_with_retry(journey_id, trigger, step.agent, Some(patch)).await {
            Ok(_) => None,
            Err(error) => {
                warn!(
                    event_name = "workflow.journey_trigger_rejected",
                    workflow_id = %instance.id,
                    journey_id = %journey_id,
                    trigger = %trigger,
                    error = %error,
                    "journey refused step completion trigger"
                );
                Some(error)
            }
        }
    }

    async fn dispatch_current_step(
        &self,
        definition: &WorkflowDefinition,
        instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let mut instance = instance;
        let mut attempt = 1;
        loop {
            if instance.status != WorkflowStatus::Running || instance.current_task_id.is_some() {
                return Ok(instance);
            }
            let step_index = instance.current_step_index;
            let Some(step) = definition.step(step_index) else {
                return Ok(instance);
            };

            let task = self.bus.task_engine().create_task(
                step.agent,
                step_payload(&instance, step),
                Some(instance.id.clone()),
                Some(step_index),
            );
            let expected_version = instance.version;
            let mut next = instance.clone();
            next.mark_dispatched(task.id.clone())?;

            if self.workflows.save_if_version(&next, expected_version).await? {
                let dispatched = task.id.clone();
                let task_id = match self.bus.enqueue_task(task).await {
                    Ok(task_id) => task_id,
                    Err(error) => {
                        if let Err(release_error) = self.release_dispatch(&next.id, &dispatched).await {
                            warn!(
                                event_name = "workflow.release_failed",
                                workflow_id = %next.id,
                                task_id = %dispatched,
                                error = %release_error,
                                "could not release step after enqueue failure"
                            );
                        }
                        return Err(error);
                    }
                };
                info!(
                    event_name = "workflow.step_dispatched",
                    workflow_id = %next.id,
                    step = step.name,
                    step_index,
                    task_id = %task_id,
                    target_agent = step.agent,
                    "workflow step dispatched"
                );
                self.announce(
                    event_types::WORKFLOW_STEP_DISPATCHED,
                    &next,
                    json!({ "step": step.name, "agent": step.agent, "task_id": task_id.0 }),
                )
                .await;
                return Ok(next);
            }

            if attempt >= self.max_attempts {
                return Err(conflict(&instance.id, expected_version));
            }
            attempt += 1;
            instance = self.load(&instance.id).await?;
        }
    }

    /// Clears `task_id` as the in-flight task when it never reached the queue.
    async fn release_dispatch(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
    ) -> Result<(), ApplicationError> {
        let (_, released) =
            self.update(workflow_id, |instance| Ok(instance.release_dispatch(task_id))).await?;
        if released {
            warn!(
                event_name = "workflow.dispatch_released",
                workflow_id = %workflow_id,
                task_id = %task_id,
                "step task was not enqueued; step awaits re-dispatch"
            );
        }
        Ok(())
    }

    async fn fail_instance(
        &self,
        workflow_id: &WorkflowId,
        reason: &str,
    ) -> Result<WorkflowInstance, ApplicationError> {
        let (instance, ()) = self.update(workflow_id, |instance| Ok(instance.fail(reason)?)).await?;

        warn!(event_name = "workflow.failed", workflow_id = %workflow_id, reason, "workflow failed");
        self.announce(event_types::WORKFLOW_FAILED, &instance, json!({ "reason": reason })).await;
        Ok(instance)
    }

    async fn cascade_force_fail(&self, instance: &WorkflowInstance, reason: &str) {
        let Some(journey_id) = &instance.journey_id else {
            return;
        };

        let mut patch = Context::new();
        patch.insert("failure_reason".to_owned(), Value::String(reason.to_owned()));
        match self
            .journeys
            .transition_with_retry(journey_id, JourneyTrigger::ForceFail, WORKFLOW_PUBLISHER, Some(patch))
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_invalid_transition() => {
                debug!(
                    event_name = "workflow.cascade_skipped",
                    workflow_id = %instance.id,
                    journey_id = %journey_id,
                    "journey already terminal"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "workflow.cascade_failed",
                    workflow_id = %instance.id,
                    journey_id = %journey_id,
                    error = %error,
                    "could not force-fail journey"
                );
            }
        }
    }

    /// Load, mutate, version-checked save; re-reads on a lost race. Skips the write when
    /// `change` left the instance untouched.
    async fn update<T>(
        &self,
        workflow_id: &WorkflowId,
        mut change: impl FnMut(&mut WorkflowInstance) -> Result<T, ApplicationError>,
    ) -> Result<(WorkflowInstance, T), ApplicationError> {
        let mut attempt = 1;
        loop {
            let mut instance = self.load(workflow_id).await?;
            let expected_version = instance.version;
            let value = change(&mut instance)?;

            if instance.version == expected_version
                || self.workflows.save_if_version(&instance, expected_version).await?
            {
                return Ok((instance, value));
            }
            if attempt >= self.max_attempts {
                return Err(conflict(workflow_id, expected_version));
            }
            attempt += 1;
        }
    }

    async fn load(&self, workflow_id: &WorkflowId) -> Result<WorkflowInstance, ApplicationError> {
        self.workflows
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| ApplicationError::WorkflowNotFound(workflow_id.clone()))
    }

    fn definition(&self, workflow_name: &str) -> Result<&WorkflowDefinition, ApplicationError> {
        self.catalog
            .get(workflow_name)
            .ok_or_else(|| ApplicationError::UnknownWorkflow(workflow_name.to_owned()))
    }

    async fn announce(&self, event_type: &str, instance: &WorkflowInstance, extra: Value) {
        let mut payload = json!({
            "workflow_id": instance.id.0,
            "workflow_name": instance.workflow_name,
            "journey_id": instance.journey_id.as_ref().map(|id| id.0.as_str()),
            "status": instance.status.as_str(),
            "step_index": instance.current_step_index,
        });
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            target.extend(extra);
        }

        if let Err(error) = self.bus.publish(AgentEvent::new(event_type, payload, WORKFLOW_PUBLISHER)).await {
            warn!(
                event_name = "workflow.publish_failed",
                workflow_id = %instance.id,
                event_type,
                error = %error,
                "failed to publish workflow event"
            );
        }
    }
}

fn conflict(workflow_id: &WorkflowId, expected_version: u32) -> ApplicationError {
    ApplicationError::ConcurrentModification {
        resource: "workflow_instance",
        id: workflow_id.0.clone(),
        expected_version,
    }
}

fn journey_id_from(
    workflow_name: &str,
    context: &Context,
) -> Result<Option<JourneyId>, ApplicationError> {
    match context.get(JOURNEY_ID_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(Some(JourneyId(id.trim().to_owned()))),
        Some(_) => Err(ApplicationError::InvalidWorkflowContext {
            workflow: workflow_name.to_owned(),
            message: format!("`{JOURNEY_ID_KEY}` must be a non-empty string"),
        }),
    }
}

fn step_payload(instance: &WorkflowInstance, step: &StepDescriptor) -> Value {
    json!({
        "workflow_id": instance.id.0,
        "step_index": instance.current_step_index,
        "step": step.name,
        "action": step.action,
        "journey_id": instance.journey_id.as_ref().map(|id| id.0.as_str()),
        "context": instance.context,
    })
}

fn step_signal(event: &AgentEvent) -> Option<(WorkflowId, StepOutcome)> {
    let workflow_id = WorkflowId(event.payload_str("workflow_id")?.to_owned());
    let task_id = TaskId(event.payload_str("task_id")?.to_owned());

    let outcome = match event.event_type.as_str() {
        event_types::TASK_COMPLETED => StepOutcome::Completed {
            task_id,
            result: event.payload.get("result").cloned().unwrap_or(Value::Null),
        },
        event_types::TASK_FAILED => StepOutcome::Failed {
            task_id,
            error: event.payload_str("error").unwrap_or("unknown error").to_owned(),
        },
        _ => return None,
    };
    Some((workflow_id, outcome))
}

/// Outcome already recorded on a finished task; `None` while it is pending or claimed.
fn finished_outcome(task: &AgentTask) -> Option<StepOutcome> {
    match task.status {
        TaskStatus::Completed => Some(StepOutcome::Completed {
            task_id: task.id.clone(),
            result: task.result.clone().unwrap_or(Value::Null),
        }),
        TaskStatus::Failed => Some(StepOutcome::Failed {
            task_id: task.id.clone(),
            error: task.error.clone().unwrap_or_else(|| "unknown error".to_owned()),
        }),
        TaskStatus::Pending | TaskStatus::Claimed => None,
    }
}
