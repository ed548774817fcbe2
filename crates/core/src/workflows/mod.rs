pub mod definitions;
pub mod instance;

pub use definitions::{
    StepDescriptor, WorkflowCatalog, WorkflowDefinition, DEAL_PIPELINE, JOURNEY_ID_KEY,
    PRICE_REVIEW, SHIPPING,
};
pub use instance::SignalDisposition;
