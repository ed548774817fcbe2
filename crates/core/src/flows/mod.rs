pub mod engine;
pub mod states;

pub use engine::{DealJourneyFlow, FlowDefinition, FlowEngine, JourneyTransitionError};
pub use states::{JourneyAction, TransitionOutcome};
