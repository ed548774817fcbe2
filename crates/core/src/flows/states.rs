use serde::{Deserialize, Serialize};

use crate::domain::journey::{JourneyState, JourneyTrigger};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyAction {
    DispatchMatchmaker,
    DispatchNegotiator,
    CreateCheckout,
    AwaitPayment,
    ArrangeShipping,
    NotifyParties,
    CloseDeal,
    EscalateToOperator,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: JourneyState,
    pub to: JourneyState,
    pub trigger: JourneyTrigger,
    pub actions: Vec<JourneyAction>,
}
