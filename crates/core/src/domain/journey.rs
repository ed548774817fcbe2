use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Context;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JourneyId(pub String);

impl JourneyId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JourneyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyState {
    InquiryReceived,
    Matching,
    Negotiating,
    OfferAccepted,
    PaymentPending,
    PaymentConfirmed,
    ShippingArranged,
    Completed,
    Cancelled,
    Failed,
}

impl JourneyState {
    pub const INITIAL: Self = Self::InquiryReceived;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InquiryReceived => "inquiry_received",
            Self::Matching => "matching",
            Self::Negotiating => "negotiating",
            Self::OfferAccepted => "offer_accepted",
            Self::PaymentPending => "payment_pending",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::ShippingArranged => "shipping_arranged",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inquiry_received" => Some(Self::InquiryReceived),
            "matching" => Some(Self::Matching),
            "negotiating" => Some(Self::Negotiating),
            "offer_accepted" => Some(Self::OfferAccepted),
            "payment_pending" => Some(Self::PaymentPending),
            "payment_confirmed" => Some(Self::PaymentConfirmed),
            "shipping_arranged" => Some(Self::ShippingArranged),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for JourneyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyTrigger {
    StartMatching,
    MatchFound,
    NoMatch,
    CounterOffer,
    OfferAccepted,
    NoAgreement,
    CheckoutStarted,
    PaymentWebhookSucceeded,
    PaymentWebhookFailed,
    ShippingBooked,
    DeliveryConfirmed,
    BuyerCancelled,
    ForceFail,
}

impl JourneyTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartMatching => "start_matching",
            Self::MatchFound => "match_found",
            Self::NoMatch => "no_match",
            Self::CounterOffer => "counter_offer",
            Self::OfferAccepted => "offer_accepted",
            Self::NoAgreement => "no_agreement",
            Self::CheckoutStarted => "checkout_started",
            Self::PaymentWebhookSucceeded => "payment_webhook_succeeded",
            Self::PaymentWebhookFailed => "payment_webhook_failed",
            Self::ShippingBooked => "shipping_booked",
            Self::DeliveryConfirmed => "delivery_confirmed",
            Self::BuyerCancelled => "buyer_cancelled",
            Self::ForceFail => "force_fail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start_matching" => Some(Self::StartMatching),
            "match_found" => Some(Self::MatchFound),
            "no_match" => Some(Self::NoMatch),
            "counter_offer" => Some(Self::CounterOffer),
            "offer_accepted" => Some(Self::OfferAccepted),
            "no_agreement" => Some(Self::NoAgreement),
            "checkout_started" => Some(Self::CheckoutStarted),
            "payment_webhook_succeeded" => Some(Self::PaymentWebhookSucceeded),
            "payment_webhook_failed" => Some(Self::PaymentWebhookFailed),
            "shipping_booked" => Some(Self::ShippingBooked),
            "delivery_confirmed" => Some(Self::DeliveryConfirmed),
            "buyer_cancelled" => Some(Self::BuyerCancelled),
            "force_fail" => Some(Self::ForceFail),
            _ => None,
        }
    }
}

impl fmt::Display for JourneyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition. Entries are append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyHistoryEntry {
    pub sequence: u32,
    pub from_state: JourneyState,
    pub to_state: JourneyState,
    pub trigger: JourneyTrigger,
    pub actor_agent: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DealJourney {
    pub id: JourneyId,
    pub current_state: JourneyState,
    pub context: Context,
    pub history: Vec<JourneyHistoryEntry>,
    /// Bumped on every persisted transition; writes are checked against it.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DealJourney {
    pub fn new(context: Context) -> Self {
        let now = Utc::now();
        Self {
            id: JourneyId::generate(),
            current_state: JourneyState::INITIAL,
            context,
            history: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn last_entry(&self) -> Option<&JourneyHistoryEntry> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::{DealJourney, JourneyState, JourneyTrigger};
    use crate::domain::Context;

    #[test]
    fn new_journey_starts_in_inquiry_received_with_empty_history() {
        let journey = DealJourney::new(Context::new());

        assert_eq!(journey.current_state, JourneyState::InquiryReceived);
        assert!(journey.history.is_empty());
        assert_eq!(journey.version, 1);
        assert!(!journey.is_terminal());
    }

    #[test]
    fn storage_labels_parse_case_insensitively() {
        assert_eq!(JourneyState::parse(" Payment_Pending "), Some(JourneyState::PaymentPending));
        assert_eq!(JourneyTrigger::parse("FORCE_FAIL"), Some(JourneyTrigger::ForceFail));
        assert_eq!(JourneyState::parse("archived"), None);
    }

    #[test]
    fn only_completed_cancelled_and_failed_are_terminal() {
        let terminal = [
            JourneyState::InquiryReceived,
            JourneyState::Matching,
            JourneyState::Negotiating,
            JourneyState::OfferAccepted,
            JourneyState::PaymentPending,
            JourneyState::PaymentConfirmed,
            JourneyState::ShippingArranged,
            JourneyState::Completed,
            JourneyState::Cancelled,
            JourneyState::Failed,
        ]
        .into_iter()
        .filter(JourneyState::is_terminal)
        .collect::<Vec<_>>();

        assert_eq!(
            terminal,
            vec![JourneyState::Completed, JourneyState::Cancelled, JourneyState::Failed]
        );
    }
}
