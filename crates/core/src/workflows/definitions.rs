use serde::Serialize;
use serde_json::Value;

use crate::domain::agent::agent_names::{LOGISTICS, MATCHMAKER, NEGOTIATOR, PRICING};
use crate::domain::journey::JourneyTrigger;
use crate::domain::Context;

/// Context key linking a workflow to a deal journey.
pub const JOURNEY_ID_KEY: &str = "journey_id";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StepDescriptor {
    pub name: &'static str,
    pub agent: &'static str,
    pub action: &'static str,
    /// Journey trigger applied when the step completes.
    pub completion_trigger: Option<JourneyTrigger>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WorkflowDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub required_context: &'static [&'static str],
    pub optional_context: &'static [&'static str],
    pub steps: &'static [StepDescriptor],
}

impl WorkflowDefinition {
    pub fn step(&self, index: usize) -> Option<&'static StepDescriptor> {
        self.steps.get(index)
    }

    pub fn requires_journey(&self) -> bool {
        self.required_context.contains(&JOURNEY_ID_KEY)
    }

    pub fn validate_context(&self, context: &Context) -> Result<(), String> {
        let missing = self
            .required_context
            .iter()
            .filter(|key| context.get(**key).map_or(true, is_blank))
            .copied()
            .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required context keys: {}", missing.join(", ")))
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

pub const DEAL_PIPELINE: WorkflowDefinition = WorkflowDefinition {
    name: "deal_pipeline",
    description: "Match an inquiry to a listing, negotiate terms, then open checkout",
    required_context: &[JOURNEY_ID_KEY],
    optional_context: &["buyer_id", "listing_id", "budget"],
    steps: &[
        StepDescriptor {
            name: "find_matches",
            agent: MATCHMAKER,
            action: "find_matches",
            completion_trigger: Some(JourneyTrigger::MatchFound),
        },
        StepDescriptor {
            name: "negotiate_terms",
            agent: NEGOTIATOR,
            action: "negotiate",
            completion_trigger: Some(JourneyTrigger::OfferAccepted),
        },
        StepDescriptor {
            name: "prepare_checkout",
            agent: PRICING,
            action: "prepare_checkout",
            completion_trigger: Some(JourneyTrigger::CheckoutStarted),
        },
    ],
};

pub const SHIPPING: WorkflowDefinition = WorkflowDefinition {
    name: "shipping",
    description: "Book export shipping after payment and confirm delivery",
    required_context: &[JOURNEY_ID_KEY],
    optional_context: &["destination_port", "listing_id"],
    steps: &[
        StepDescriptor {
            name: "book_shipping",
            agent: LOGISTICS,
            action: "book_shipping",
            completion_trigger: Some(JourneyTrigger::ShippingBooked),
        },
        StepDescriptor {
            name: "confirm_delivery",
            agent: LOGISTICS,
            action: "confirm_delivery",
            completion_trigger: Some(JourneyTrigger::DeliveryConfirmed),
        },
    ],
};

pub const PRICE_REVIEW: WorkflowDefinition = WorkflowDefinition {
    name: "price_review",
    description: "Ask the pricing agent for a suggested asking price",
    required_context: &["listing_id"],
    optional_context: &["asking_price"],
    steps: &[StepDescriptor {
        name: "suggest_price",
        agent: PRICING,
        action: "suggest_price",
        completion_trigger: None,
    }],
};

/// Static set of workflow definitions known at startup.
#[derive(Clone, Debug)]
pub struct WorkflowCatalog {
    definitions: Vec<WorkflowDefinition>,
}

impl WorkflowCatalog {
    pub fn new(definitions: Vec<WorkflowDefinition>) -> Self {
        Self { definitions }
    }

    pub fn builtin() -> Self {
        Self::new(vec![DEAL_PIPELINE, SHIPPING, PRICE_REVIEW])
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.definitions.iter().find(|definition| definition.name == name)
    }

    pub fn definitions(&self) -> &[WorkflowDefinition] {
        &self.definitions
    }
}

impl Default for WorkflowCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
