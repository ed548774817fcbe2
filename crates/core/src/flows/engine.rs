use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::journey::{JourneyHistoryEntry, JourneyId, JourneyState, JourneyTrigger};
use crate::flows::states::{JourneyAction, TransitionOutcome};

pub trait FlowDefinition {
    fn initial_state(&self) -> JourneyState;
    fn transition(
        &self,
        current: JourneyState,
        trigger: JourneyTrigger,
    ) -> Result<TransitionOutcome, JourneyTransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct DealJourneyFlow;

impl FlowDefinition for DealJourneyFlow {
    fn initial_state(&self) -> JourneyState {
        JourneyState::INITIAL
    }

    fn transition(
        &self,
        current: JourneyState,
        trigger: JourneyTrigger,
    ) -> Result<TransitionOutcome, JourneyTransitionError> {
        transition_deal_journey(current, trigger)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> JourneyState {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: JourneyState,
        trigger: JourneyTrigger,
    ) -> Result<TransitionOutcome, JourneyTransitionError> {
        self.flow.transition(current, trigger)
    }

    pub fn apply_with_audit<S>(
        &self,
        journey_id: &JourneyId,
        current: JourneyState,
        trigger: JourneyTrigger,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, JourneyTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, trigger);
        if let Err(error) = &result {
            sink.emit(
                AuditEvent::new(
                    "journey.transition_rejected",
                    AuditCategory::Journey,
                    "deal_journey",
                    journey_id.0.clone(),
                    audit,
                    AuditOutcome::Rejected,
                )
                .with_metadata("state", current.as_str())
                .with_metadata("trigger", trigger.as_str())
                .with_metadata("error", error.to_string()),
            );
        }
        result
    }

    /// Re-applies recorded triggers from the initial state.
    pub fn replay(
        &self,
        history: &[JourneyHistoryEntry],
    ) -> Result<JourneyState, JourneyTransitionError> {
        history.iter().try_fold(self.initial_state(), |state, entry| {
            if state != entry.from_state {
                return Err(JourneyTransitionError::HistoryDiverged {
                    sequence: entry.sequence,
                    expected: entry.from_state,
                    actual: state,
                });
            }
            let outcome = self.apply(state, entry.trigger)?;
            if outcome.to != entry.to_state {
                return Err(JourneyTransitionError::HistoryDiverged {
                    sequence: entry.sequence,
                    expected: entry.to_state,
                    actual: outcome.to,
                });
            }
            Ok(outcome.to)
        })
    }
}

impl Default for FlowEngine<DealJourneyFlow> {
    fn default() -> Self {
        Self::new(DealJourneyFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JourneyTransitionError {
    #[error("invalid transition from {state} using trigger {trigger}")]
    InvalidTransition { state: JourneyState, trigger: JourneyTrigger },
    #[error("history entry {sequence} diverged: expected {expected}, replay produced {actual}")]
    HistoryDiverged { sequence: u32, expected: JourneyState, actual: JourneyState },
}

fn transition_deal_journey(
    current: JourneyState,
    trigger: JourneyTrigger,
) -> Result<TransitionOutcome, JourneyTransitionError> {
    use JourneyAction::{
        ArrangeShipping, AwaitPayment, CloseDeal, CreateCheckout, DispatchMatchmaker,
        DispatchNegotiator, EscalateToOperator, NotifyParties,
    };
    use JourneyState::{
        Cancelled, Completed, Failed, InquiryReceived, Matching, Negotiating, OfferAccepted,
        PaymentConfirmed, PaymentPending, ShippingArranged,
    };
    use JourneyTrigger::{
        BuyerCancelled, CheckoutStarted, CounterOffer, DeliveryConfirmed, ForceFail, MatchFound,
        NoAgreement, NoMatch, PaymentWebhookFailed, PaymentWebhookSucceeded, ShippingBooked,
        StartMatching,
    };

    if current.is_terminal() {
        return Err(JourneyTransitionError::InvalidTransition { state: current, trigger });
    }

    let (to, actions) = match (current, trigger) {
        (InquiryReceived, StartMatching) => (Matching, vec![DispatchMatchmaker]),
        (InquiryReceived, MatchFound) | (Matching, MatchFound) => {
            (Negotiating, vec![DispatchNegotiator])
        }
        (Matching, NoMatch) => (Cancelled, vec![NotifyParties]),
        (Negotiating, CounterOffer) => (Negotiating, vec![DispatchNegotiator]),
        (Negotiating, JourneyTrigger::OfferAccepted) => (OfferAccepted, vec![CreateCheckout]),
        (Negotiating, NoAgreement) => (Cancelled, vec![NotifyParties]),
        (OfferAccepted, CheckoutStarted) => (PaymentPending, vec![AwaitPayment]),
        (PaymentPending, PaymentWebhookSucceeded) => {
            (PaymentConfirmed, vec![ArrangeShipping, NotifyParties])
        }
        (PaymentPending, PaymentWebhookFailed) => (OfferAccepted, vec![CreateCheckout]),
        (PaymentConfirmed, ShippingBooked) => (ShippingArranged, vec![NotifyParties]),
        (ShippingArranged, DeliveryConfirmed) => (Completed, vec![CloseDeal, NotifyParties]),
        (InquiryReceived | Matching | Negotiating | OfferAccepted | PaymentPending, BuyerCancelled) => {
            (Cancelled, vec![NotifyParties])
        }
        (_, ForceFail) => (Failed, vec![EscalateToOperator]),
        _ => {
            return Err(JourneyTransitionError::InvalidTransition { state: current, trigger });
        }
    };

    Ok(TransitionOutcome { from: current, to, trigger, actions })
}
