use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use exportdesk_core::domain::agent::AgentTask;
use exportdesk_core::safety::{SafetyCheckResult, SafetyFilter, SafetyVerdict};

use crate::agents::Agent;

/// Result field a negotiator uses for its outbound message.
pub const DRAFT_FIELD: &str = "draft";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftDisposition {
    Sendable,
    HeldForReview,
    Replaced,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GuardedDraft {
    /// What may go out: the original draft, or the fallback when blocked.
    pub text: String,
    pub disposition: DraftDisposition,
    pub check: SafetyCheckResult,
}

impl GuardedDraft {
    pub fn is_sendable(&self) -> bool {
        self.disposition == DraftDisposition::Sendable
    }
}

/// Applies the safety verdict to negotiator drafts. A blocked draft never leaves as sendable.
#[derive(Clone, Debug)]
pub struct NegotiationGuard {
    filter: SafetyFilter,
}

impl Default for NegotiationGuard {
    fn default() -> Self {
        Self::new(SafetyFilter::standard().clone())
    }
}

impl NegotiationGuard {
    pub fn new(filter: SafetyFilter) -> Self {
        Self { filter }
    }

    pub fn review(&self, draft: &str) -> GuardedDraft {
        let check = self.filter.check_response(draft);
        match check.action {
            SafetyVerdict::Send => GuardedDraft {
                text: draft.to_owned(),
                disposition: DraftDisposition::Sendable,
                check,
            },
            SafetyVerdict::HumanReview => GuardedDraft {
                text: draft.to_owned(),
                disposition: DraftDisposition::HeldForReview,
                check,
            },
            SafetyVerdict::Block => GuardedDraft {
                text: check.modified_response.clone().unwrap_or_default(),
                disposition: DraftDisposition::Replaced,
                check,
            },
        }
    }
}

/// Wraps a negotiator so every `draft` it produces is reviewed before the task completes.
/// A draft that is held or blocked fails the task instead of completing it.
pub struct GuardedNegotiator<A> {
    inner: A,
    guard: NegotiationGuard,
}

impl<A> GuardedNegotiator<A> {
    pub fn new(inner: A, guard: NegotiationGuard) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl<A> Agent for GuardedNegotiator<A>
where
    A: Agent,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, task: &AgentTask) -> Result<Value> {
        let mut result = self.inner.execute(task).await?;
        let Some(fields) = result.as_object_mut() else {
            return Ok(result);
        };
        let Some(draft) = fields.get(DRAFT_FIELD).and_then(Value::as_str).map(str::to_owned) else {
            return Ok(result);
        };

        let guarded = self.guard.review(&draft);
        let verdict = match guarded.disposition {
            DraftDisposition::Sendable => None,
            DraftDisposition::HeldForReview => {
                info!(
                    event_name = "safety.draft_held",
                    task_id = %task.id,
                    violations = guarded.check.violations.len(),
                    "negotiator draft held for human review"
                );
                Some("held for review")
            }
            DraftDisposition::Replaced => {
                warn!(
                    event_name = "safety.draft_blocked",
                    task_id = %task.id,
                    violations = guarded.check.violations.len(),
                    "negotiator draft blocked and replaced"
                );
                Some("blocked")
            }
        };
        // A draft that may not go out must not let the step advance the deal.
        if let Some(verdict) = verdict {
            bail!("negotiator draft {verdict}: {}", violation_types(&guarded.check));
        }

        fields.insert(DRAFT_FIELD.to_owned(), Value::String(guarded.text.clone()));
        fields.insert("sendable".to_owned(), Value::Bool(guarded.is_sendable()));
        fields.insert("disposition".to_owned(), serde_json::to_value(guarded.disposition)?);
        fields.insert("safety".to_owned(), serde_json::to_value(&guarded.check)?);
        Ok(result)
    }
}

fn violation_types(check: &SafetyCheckResult) -> String {
    let mut types = Vec::new();
    for violation in &check.violations {
        let name = violation.violation_type.as_str();
        if !types.contains(&name) {
            types.push(name);
        }
    }
    types.join(", ")
}
