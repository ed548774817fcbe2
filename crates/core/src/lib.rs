pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod realtime;
pub mod safety;
pub mod tasks;
pub mod workflows;

pub use domain::agent::{AgentEvent, AgentTask, TaskId, TaskStatus};
pub use domain::journey::{DealJourney, JourneyHistoryEntry, JourneyId, JourneyState, JourneyTrigger};
pub use domain::workflow::{StepOutcome, WorkflowId, WorkflowInstance, WorkflowStatus};
pub use domain::{merge_context, Context};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{DealJourneyFlow, FlowEngine, JourneyAction, JourneyTransitionError};
pub use safety::{SafetyCheckResult, SafetyFilter, SafetyVerdict, SafetyViolation};
pub use tasks::{TaskEngine, TaskEngineConfig};
pub use workflows::{WorkflowCatalog, WorkflowDefinition};
