//! Workflow instance lifecycle.
//!
//! Status changes for a single workflow run. The orchestration service persists the
//! returned instance with a version check, so every mutator bumps `version`.

use chrono::Utc;
use serde_json::Value;

use crate::domain::agent::TaskId;
use crate::domain::journey::JourneyId;
use crate::domain::workflow::{StepOutcome, WorkflowId, WorkflowInstance, WorkflowStatus};
use crate::domain::{merge_context, Context};
use crate::errors::DomainError;
use crate::workflows::definitions::WorkflowDefinition;

/// What to do with a step signal given the instance's current state.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalDisposition {
    /// Matches the in-flight step; apply it now.
    Apply(StepOutcome),
    /// Instance is paused; the outcome was stored for resume.
    Buffered,
    /// Unknown task, duplicate, or the workflow already finished.
    Ignored,
}

impl WorkflowInstance {
    pub fn start(definition: &WorkflowDefinition, journey_id: Option<JourneyId>, context: Context) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::generate(),
            workflow_name: definition.name.to_owned(),
            journey_id,
            status: if definition.steps.is_empty() {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Running
            },
            current_step_index: 0,
            total_steps: definition.steps.len(),
            context,
            current_task_id: None,
            pending_outcome: None,
            failure_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_step_index >= self.total_steps
    }

    pub fn pause(&mut self) -> Result<(), DomainError> {
        self.require(WorkflowStatus::Running, "pause")?;
        self.status = WorkflowStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Returns the outcome buffered while paused, if any.
    pub fn resume(&mut self) -> Result<Option<StepOutcome>, DomainError> {
        self.require(WorkflowStatus::Paused, "resume")?;
        self.status = WorkflowStatus::Running;
        self.touch();
        Ok(self.pending_outcome.take())
    }

    pub fn mark_dispatched(&mut self, task_id: TaskId) -> Result<(), DomainError> {
        self.require(WorkflowStatus::Running, "dispatch")?;
        self.current_task_id = Some(task_id);
        self.touch();
        Ok(())
    }

    /// Forgets `task_id` as the in-flight task so the current step can be dispatched again.
    /// Returns `false` when the instance has already moved past that task.
    pub fn release_dispatch(&mut self, task_id: &TaskId) -> bool {
        if self.status.is_terminal() || self.current_task_id.as_ref() != Some(task_id) {
            return false;
        }
        self.current_task_id = None;
        self.touch();
        true
    }

    pub fn classify_signal(&mut self, outcome: StepOutcome) -> SignalDisposition {
        if self.status.is_terminal() || self.current_task_id.as_ref() != Some(outcome.task_id()) {
            return SignalDisposition::Ignored;
        }

        match self.status {
            WorkflowStatus::Paused if self.pending_outcome.is_none() => {
                self.pending_outcome = Some(outcome);
                self.touch();
                SignalDisposition::Buffered
            }
            WorkflowStatus::Running => SignalDisposition::Apply(outcome),
            _ => SignalDisposition::Ignored,
        }
    }

    /// Merges the step result under the step name and moves to the next step.
    pub fn advance(&mut self, step_name: &str, result: Value) -> Result<(), DomainError> {
        self.require(WorkflowStatus::Running, "advance")?;
        if self.is_finished() {
            return Err(DomainError::InvariantViolation(format!(
                "workflow {} has no step at index {}",
                self.id, self.current_step_index
            )));
        }

        let mut patch = Context::new();
        patch.insert(step_name.to_owned(), result);
        merge_context(&mut self.context, patch);

        self.current_step_index += 1;
        self.current_task_id = None;
        if self.is_finished() {
            self.status = WorkflowStatus::Completed;
        }
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.status = WorkflowStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.current_task_id = None;
        self.pending_outcome = None;
        self.touch();
        Ok(())
    }

    fn require(&self, status: WorkflowStatus, action: &'static str) -> Result<(), DomainError> {
        if self.status == status {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> DomainError {
        DomainError::InvalidWorkflowTransition { workflow_id: self.id.clone(), status: self.status, action }
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::SignalDisposition;
    use crate::domain::agent::TaskId;
    use crate::domain::workflow::{StepOutcome, WorkflowInstance, WorkflowStatus};
    use crate::domain::Context;
    use crate::errors::DomainError;
    use crate::workflows::definitions::{PRICE_REVIEW, SHIPPING};

    fn completed(task: &str) -> StepOutcome {
        StepOutcome::Completed { task_id: TaskId(task.to_owned()), result: json!({ "ok": true }) }
    }

    #[test]
    fn start_begins_running_at_step_zero() {
        let instance = WorkflowInstance::start(&SHIPPING, None, Context::new());

        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.current_step_index, 0);
        assert_eq!(instance.total_steps, 2);
        assert_eq!(instance.version, 1);
    }

    #[test]
    fn advancing_past_last_step_completes_and_merges_results() {
        let mut instance = WorkflowInstance::start(&PRICE_REVIEW, None, Context::new());
        instance.mark_dispatched(TaskId("t-1".to_owned())).unwrap();

        instance.advance("suggest_price", json!({ "price": 8200 })).unwrap();

        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.current_step_index, 1);
        assert!(instance.current_task_id.is_none());
        assert_eq!(instance.context.get("suggest_price"), Some(&json!({ "price": 8200 })));
        assert!(instance.advance("again", json!(null)).is_err());
    }

    #[test]
    fn signals_for_other_tasks_are_ignored() {
        let mut instance = WorkflowInstance::start(&SHIPPING, None, Context::new());
        instance.mark_dispatched(TaskId("t-current".to_owned())).unwrap();

        assert_eq!(instance.classify_signal(completed("t-old")), SignalDisposition::Ignored);
        assert!(matches!(
            instance.classify_signal(completed("t-current")),
            SignalDisposition::Apply(_)
        ));
    }

    #[test]
    fn paused_instance_buffers_one_signal_until_resume() {
        let mut instance = WorkflowInstance::start(&SHIPPING, None, Context::new());
        instance.mark_dispatched(TaskId("t-1".to_owned())).unwrap();
        instance.pause().unwrap();

        assert_eq!(instance.classify_signal(completed("t-1")), SignalDisposition::Buffered);
        assert_eq!(instance.classify_signal(completed("t-1")), SignalDisposition::Ignored);
        assert_eq!(instance.current_step_index, 0);

        let buffered = instance.resume().unwrap();
        assert_eq!(buffered, Some(completed("t-1")));
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert!(instance.pending_outcome.is_none());
    }

    #[test]
    fn release_dispatch_only_forgets_the_in_flight_task() {
        let mut instance = WorkflowInstance::start(&SHIPPING, None, Context::new());
        instance.mark_dispatched(TaskId("t-1".to_owned())).unwrap();
        let version = instance.version;

        assert!(!instance.release_dispatch(&TaskId("t-other".to_owned())));
        assert_eq!(instance.version, version);

        assert!(instance.release_dispatch(&TaskId("t-1".to_owned())));
        assert!(instance.current_task_id.is_none());
        assert_eq!(instance.version, version + 1);
        assert_eq!(instance.status, WorkflowStatus::Running);
    }

    #[test]
    fn pause_and_resume_require_matching_status() {
        let mut instance = WorkflowInstance::start(&SHIPPING, None, Context::new());

        assert!(matches!(
            instance.resume(),
            Err(DomainError::InvalidWorkflowTransition { action: "resume", .. })
        ));
        instance.pause().unwrap();
        assert!(instance.pause().is_err());
    }

    #[test]
    fn failed_instance_rejects_further_changes() {
        let mut instance = WorkflowInstance::start(&SHIPPING, None, Context::new());
        instance.fail("operator abort").unwrap();

        assert_eq!(instance.status, WorkflowStatus::Failed);
        assert_eq!(instance.failure_reason.as_deref(), Some("operator abort"));
        assert!(instance.fail("again").is_err());
        assert!(instance.pause().is_err());
        assert_eq!(instance.classify_signal(completed("t-1")), SignalDisposition::Ignored);
    }
}
