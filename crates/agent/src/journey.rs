use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use exportdesk_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use exportdesk_core::domain::agent::{event_types, AgentEvent};
use exportdesk_core::domain::journey::{
    DealJourney, JourneyHistoryEntry, JourneyId, JourneyState, JourneyTrigger,
};
use exportdesk_core::domain::{merge_context, Context};
use exportdesk_core::errors::{ApplicationError, DomainError};
use exportdesk_core::flows::{DealJourneyFlow, FlowEngine, TransitionOutcome};
use exportdesk_db::JourneyRepository;

use crate::bus::AgentEventBus;

pub const DEFAULT_MAX_TRANSITION_ATTEMPTS: u32 = 3;

/// Persists deal journeys and applies transitions with a version check.
pub struct JourneyService {
    journeys: Arc<dyn JourneyRepository>,
    audit: Arc<dyn AuditSink>,
    flow: FlowEngine<DealJourneyFlow>,
    events: Option<Arc<AgentEventBus>>,
    max_attempts: u32,
}

impl JourneyService {
    pub fn new(journeys: Arc<dyn JourneyRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            journeys,
            audit,
            flow: FlowEngine::default(),
            events: None,
            max_attempts: DEFAULT_MAX_TRANSITION_ATTEMPTS,
        }
    }

    /// Publishes `journey.transitioned` on the bus after each committed transition.
    pub fn with_events(mut self, bus: Arc<AgentEventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn create_journey(&self, context: Context) -> Result<DealJourney, ApplicationError> {
        let journey = DealJourney::new(context);
        self.journeys.insert(&journey).await?;

        self.audit.emit(AuditEvent::new(
            "journey.created",
            AuditCategory::Journey,
            "deal_journey",
            journey.id.0.clone(),
            &AuditContext::new(journey.id.0.clone(), "system"),
            AuditOutcome::Success,
        ));
        info!(event_name = "journey.created", journey_id = %journey.id, "deal journey created");
        Ok(journey)
    }

    pub async fn get_journey(&self, id: &JourneyId) -> Result<DealJourney, ApplicationError> {
        self.journeys
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::JourneyNotFound(id.clone()))
    }

    pub async fn get_history(
        &self,
        id: &JourneyId,
    ) -> Result<Vec<JourneyHistoryEntry>, ApplicationError> {
        Ok(self.get_journey(id).await?.history)
    }

    /// Replays the stored history and checks it lands on the stored state.
    pub async fn verify_history(&self, id: &JourneyId) -> Result<JourneyState, ApplicationError> {
        let journey = self.get_journey(id).await?;
        let replayed = self.flow.replay(&journey.history)?;
        if replayed != journey.current_state {
            return Err(DomainError::InvariantViolation(format!(
                "journey {id} replays to {replayed} but is stored as {}",
                journey.current_state
            ))
            .into());
        }
        Ok(replayed)
    }

    /// Target state `trigger` would reach from the journey's current state, without writing.
    pub async fn check_transition(
        &self,
        id: &JourneyId,
        trigger: JourneyTrigger,
    ) -> Result<JourneyState, ApplicationError> {
        let journey = self.get_journey(id).await?;
        Ok(self.flow.apply(journey.current_state, trigger)?.to)
    }

    /// Single attempt. A lost version race returns `ConcurrentModification` and leaves the
    /// stored journey untouched.
    pub async fn transition(
        &self,
        id: &JourneyId,
        trigger: JourneyTrigger,
        actor: &str,
        context_patch: Option<Context>,
    ) -> Result<DealJourney, ApplicationError> {
        let journey = self.get_journey(id).await?;
        let audit = AuditContext::new(id.0.clone(), actor);
        let outcome = self.flow.apply_with_audit(
            id,
            journey.current_state,
            trigger,
            self.audit.as_ref(),
            &audit,
        )?;

        let expected_version = journey.version;
        let now = Utc::now();
        let entry = JourneyHistoryEntry {
            sequence: journey.last_entry().map_or(1, |last| last.sequence + 1),
            from_state: outcome.from,
            to_state: outcome.to,
            trigger,
            actor_agent: actor.to_owned(),
            occurred_at: now,
        };

        let mut next = journey;
        if let Some(patch) = context_patch {
            merge_context(&mut next.context, patch);
        }
        next.current_state = outcome.to;
        next.version = expected_version + 1;
        next.updated_at = now;

        if !self.journeys.save_transition(&next, expected_version, &entry).await? {
            debug!(
                event_name = "journey.transition_conflict",
                journey_id = %id,
                trigger = %trigger,
                expected_version,
                "journey changed between read and write"
            );
            return Err(ApplicationError::ConcurrentModification {
                resource: "deal_journey",
                id: id.0.clone(),
                expected_version,
            });
        }
        next.history.push(entry);

        self.audit.emit(
            AuditEvent::new(
                "journey.transition_applied",
                AuditCategory::Journey,
                "deal_journey",
                id.0.clone(),
                &audit,
                AuditOutcome::Success,
            )
            .with_metadata("from", outcome.from.as_str())
            .with_metadata("to", outcome.to.as_str())
            .with_metadata("trigger", trigger.as_str()),
        );
        info!(
            event_name = "journey.transitioned",
            journey_id = %id,
            from = %outcome.from,
            to = %outcome.to,
            trigger = %trigger,
            actor,
            "journey transition applied"
        );

        self.announce(id, &outcome, actor).await;
        Ok(next)
    }

    /// Re-reads and retries on `ConcurrentModification` only, up to the configured attempts.
    pub async fn transition_with_retry(
        &self,
        id: &JourneyId,
        trigger: JourneyTrigger,
        actor: &str,
        context_patch: Option<Context>,
    ) -> Result<DealJourney, ApplicationError> {
        let mut attempt = 1;
        loop {
            match self.transition(id, trigger, actor, context_patch.clone()).await {
                Err(error) if error.is_concurrent_modification() && attempt < self.max_attempts => {
                    debug!(
                        event_name = "journey.transition_retry",
                        journey_id = %id,
                        trigger = %trigger,
                        attempt,
                        "retrying journey transition"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn announce(&self, id: &JourneyId, outcome: &TransitionOutcome, actor: &str) {
        let Some(bus) = &self.events else {
            return;
        };

        let event = AgentEvent::new(
            event_types::JOURNEY_TRANSITIONED,
            json!({
                "journey_id": id.0,
                "from": outcome.from,
                "to": outcome.to,
                "trigger": outcome.trigger,
                "actor": actor,
                "actions": outcome.actions,
            }),
            actor,
        );
        if let Err(error) = bus.publish(event).await {
            warn!(
                event_name = "journey.publish_failed",
                journey_id = %id,
                error = %error,
                "failed to publish journey transition"
            );
        }
    }
}
