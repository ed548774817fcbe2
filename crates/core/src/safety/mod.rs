//! Outbound message safety filter
//!
//! Scans negotiator drafts against pattern tables before they may be sent. A verdict is a
//! plain return value; callers must refuse to send a `Block` verdict.

pub mod rules;

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rules::{default_negations, default_rules, SafetyRule, Severity, ViolationAction, ViolationType};

const PAYMENT_FALLBACK: &str = "For your protection, payments are only accepted through our secure \
     checkout. Please continue the conversation on the platform.";
const CONDITION_FALLBACK: &str = "Please review the inspection report attached to the listing for \
     the verified condition of this vehicle.";
const GENERIC_FALLBACK: &str = "A team member will follow up with the details of this offer shortly.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyVerdict {
    Send,
    Block,
    HumanReview,
}

impl SafetyVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Block => "block",
            Self::HumanReview => "human_review",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyViolation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub severity: Severity,
    /// Literal matched substring.
    pub excerpt: String,
    pub action: ViolationAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyCheckResult {
    pub safe: bool,
    pub violations: Vec<SafetyViolation>,
    pub action: SafetyVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_response: Option<String>,
}

#[derive(Debug, Error)]
pub enum SafetyRuleError {
    #[error("invalid safety pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Clone, Debug)]
struct CompiledRule {
    rule: SafetyRule,
    regex: Regex,
}

#[derive(Clone, Debug)]
pub struct SafetyFilter {
    rules: Vec<CompiledRule>,
    negations: Vec<Regex>,
}

impl SafetyFilter {
    pub fn with_rules(rules: Vec<SafetyRule>, negations: Vec<String>) -> Result<Self, SafetyRuleError> {
        let rules = rules
            .into_iter()
            .map(|rule| compile(&rule.pattern).map(|regex| CompiledRule { rule, regex }))
            .collect::<Result<Vec<_>, _>>()?;
        let negations = negations.iter().map(|pattern| compile(pattern)).collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules, negations })
    }

    /// Shared filter built from the built-in tables.
    pub fn standard() -> &'static SafetyFilter {
        static STANDARD: OnceLock<SafetyFilter> = OnceLock::new();
        STANDARD.get_or_init(|| {
            SafetyFilter::with_rules(default_rules(), default_negations())
                .expect("built-in safety patterns compile")
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn check_response(&self, text: &str) -> SafetyCheckResult {
        let violations = self
            .rules
            .iter()
            .flat_map(|compiled| {
                compiled
                    .regex
                    .find_iter(text)
                    .filter(|found| {
                        !(compiled.rule.suppress_on_negation
                            && self.is_negated(text, found.start(), found.end()))
                    })
                    .map(|found| SafetyViolation {
                        violation_type: compiled.rule.violation_type,
                        severity: compiled.rule.severity,
                        excerpt: found.as_str().to_owned(),
                        action: compiled.rule.action,
                    })
            })
            .collect::<Vec<_>>();

        decide(violations)
    }

    fn is_negated(&self, text: &str, start: usize, end: usize) -> bool {
        let sentence = sentence_around(text, start, end);
        self.negations.iter().any(|negation| negation.is_match(sentence))
    }
}

fn compile(pattern: &str) -> Result<Regex, SafetyRuleError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| SafetyRuleError::InvalidPattern { pattern: pattern.to_owned(), source })
}

fn sentence_around(text: &str, start: usize, end: usize) -> &str {
    let is_terminator = |c: char| matches!(c, '.' | '!' | '?' | '\n');
    let sentence_start = text[..start].rfind(is_terminator).map_or(0, |index| index + 1);
    let sentence_end = text[end..].find(is_terminator).map_or(text.len(), |index| end + index);
    &text[sentence_start..sentence_end]
}

fn decide(violations: Vec<SafetyViolation>) -> SafetyCheckResult {
    let first_high = violations.iter().find(|violation| violation.severity == Severity::High);

    if let Some(high) = first_high {
        let fallback = match high.violation_type {
            ViolationType::PaymentScam => PAYMENT_FALLBACK,
            ViolationType::FalseCondition => CONDITION_FALLBACK,
            ViolationType::UnauthorizedDiscount => GENERIC_FALLBACK,
        };
        return SafetyCheckResult {
            safe: false,
            violations,
            action: SafetyVerdict::Block,
            modified_response: Some(fallback.to_owned()),
        };
    }

    let action = if violations.iter().any(|violation| violation.severity == Severity::Medium) {
        SafetyVerdict::HumanReview
    } else {
        SafetyVerdict::Send
    };
    SafetyCheckResult { safe: true, violations, action, modified_response: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(text: &str) -> SafetyCheckResult {
        SafetyFilter::standard().check_response(text)
    }

    #[test]
    fn western_union_offer_is_blocked_as_payment_scam() {
        let result = check("I can offer you Western Union payment");

        assert!(!result.safe);
        assert_eq!(result.action, SafetyVerdict::Block);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].violation_type, ViolationType::PaymentScam);
        assert_eq!(result.violations[0].severity, Severity::High);
        assert_eq!(result.violations[0].excerpt, "Western Union");
        assert_eq!(result.modified_response.as_deref(), Some(PAYMENT_FALLBACK));
    }

    #[test]
    fn refused_discount_is_not_flagged() {
        let result = check("I cannot give you a discount of 20%");

        assert!(result.safe);
        assert_eq!(result.action, SafetyVerdict::Send);
        assert!(result.violations.is_empty());
        assert!(result.modified_response.is_none());
    }

    #[test]
    fn granted_discount_goes_to_human_review() {
        let result = check("Good news, I can take $500 off if you pay this week.");

        assert!(result.safe);
        assert_eq!(result.action, SafetyVerdict::HumanReview);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].violation_type, ViolationType::UnauthorizedDiscount);
        assert_eq!(result.violations[0].action, ViolationAction::Flag);
    }

    #[test]
    fn negation_only_applies_within_the_matching_sentence() {
        let result = check("I cannot lower the mileage. But I will give you 10% off today.");

        assert_eq!(result.action, SafetyVerdict::HumanReview);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].excerpt, "10% off");
    }

    #[test]
    fn unrelated_negation_does_not_hide_a_granted_discount() {
        for text in [
            "Not a problem, I can take $500 off the price",
            "Not a problem, I can offer you 10% off.",
            "No worries, I will not make you wait. I can lower the price to 18,000.",
        ] {
            let result = check(text);
            assert_eq!(result.action, SafetyVerdict::HumanReview, "{text}");
            assert_eq!(result.violations.len(), 1, "{text}");
            assert_eq!(result.violations[0].violation_type, ViolationType::UnauthorizedDiscount);
        }

        assert_eq!(check("Sorry, I cannot offer a discount of 10%.").action, SafetyVerdict::Send);
    }

    #[test]
    fn absolute_condition_claims_are_blocked() {
        let result = check("This car is in perfect condition, no scratches");

        assert_eq!(result.action, SafetyVerdict::Block);
        assert_eq!(result.violations.len(), 2);
        assert!(result
            .violations
            .iter()
            .all(|violation| violation.violation_type == ViolationType::FalseCondition));
        assert_eq!(result.modified_response.as_deref(), Some(CONDITION_FALLBACK));
    }

    #[test]
    fn off_platform_contact_requires_active_intervention() {
        let result = check("Contact me on WhatsApp so we can finish outside the platform.");

        assert_eq!(result.action, SafetyVerdict::Block);
        assert_eq!(result.violations.len(), 2);
        assert!(result
            .violations
            .iter()
            .all(|violation| violation.action == ViolationAction::ActiveIntervention));
    }

    #[test]
    fn clean_message_is_sendable() {
        let result = check("The vehicle is available. Shipping to Mombasa takes about five weeks.");

        assert_eq!(
            result,
            SafetyCheckResult {
                safe: true,
                violations: Vec::new(),
                action: SafetyVerdict::Send,
                modified_response: None,
            }
        );
    }

    #[test]
    fn repeated_checks_are_identical() {
        let text = "Pay me in cash and I will knock 300 off. It is like new.";
        assert_eq!(check(text), check(text));
    }

    #[test]
    fn custom_tables_are_supported_and_validated() {
        let filter = SafetyFilter::with_rules(
            vec![SafetyRule::new(
                ViolationType::FalseCondition,
                r"\bzero\s+rust\b",
                Severity::Low,
                ViolationAction::Flag,
            )],
            Vec::new(),
        )
        .expect("valid pattern");
        let result = filter.check_response("Zero rust on the frame");
        assert_eq!(result.action, SafetyVerdict::Send);
        assert_eq!(result.violations.len(), 1);

        let error = SafetyFilter::with_rules(
            vec![SafetyRule::new(
                ViolationType::PaymentScam,
                "(unclosed",
                Severity::High,
                ViolationAction::Block,
            )],
            Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(error, SafetyRuleError::InvalidPattern { .. }));
    }

    #[test]
    fn verdict_serializes_with_wire_labels() {
        let json = serde_json::to_value(check("This one is like new")).expect("serialize");

        assert_eq!(json["action"], "block");
        assert_eq!(json["violations"][0]["type"], "false_condition");
        assert_eq!(json["violations"][0]["severity"], "HIGH");
        assert!(json["modifiedResponse"].is_string());
    }
}
