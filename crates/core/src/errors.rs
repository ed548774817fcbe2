use thiserror::Error;

use crate::domain::agent::{TaskId, TaskStatus};
use crate::domain::journey::JourneyId;
use crate::domain::workflow::{WorkflowId, WorkflowStatus};
use crate::flows::JourneyTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    JourneyTransition(#[from] JourneyTransitionError),
    #[error("workflow {workflow_id} cannot {action} while {status}")]
    InvalidWorkflowTransition { workflow_id: WorkflowId, status: WorkflowStatus, action: &'static str },
    #[error("task {task_id} cannot move from {from:?} to {to:?}")]
    InvalidTaskTransition { task_id: TaskId, from: TaskStatus, to: TaskStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("journey not found: {0}")]
    JourneyNotFound(JourneyId),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    #[error("unknown workflow definition `{0}`")]
    UnknownWorkflow(String),
    #[error("invalid context for workflow `{workflow}`: {message}")]
    InvalidWorkflowContext { workflow: String, message: String },
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("{resource} {id} changed concurrently (expected version {expected_version})")]
    ConcurrentModification { resource: &'static str, id: String, expected_version: u32 },
    #[error("step {step_index} of workflow {workflow_id} failed: {reason}")]
    StepExecutionFailure { workflow_id: WorkflowId, step_index: usize, reason: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl From<JourneyTransitionError> for ApplicationError {
    fn from(value: JourneyTransitionError) -> Self {
        Self::Domain(DomainError::JourneyTransition(value))
    }
}

impl ApplicationError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            Self::Domain(DomainError::JourneyTransition(
                JourneyTransitionError::InvalidTransition { .. }
            ))
        )
    }

    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => {
                "The resource is not in a state that allows this action. Refresh and retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        let message = value.to_string();
        match value {
            ApplicationError::Domain(DomainError::InvariantViolation(_))
            | ApplicationError::UnknownWorkflow(_)
            | ApplicationError::InvalidWorkflowContext { .. } => {
                Self::BadRequest { message, correlation_id }
            }
            ApplicationError::JourneyNotFound(_)
            | ApplicationError::WorkflowNotFound(_)
            | ApplicationError::TaskNotFound(_) => Self::NotFound { message, correlation_id },
            ApplicationError::Domain(_) | ApplicationError::ConcurrentModification { .. } => {
                Self::Conflict { message, correlation_id }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::StepExecutionFailure { .. }
            | ApplicationError::Configuration(_) => Self::Internal { message, correlation_id },
        }
    }
}
