use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    PaymentScam,
    UnauthorizedDiscount,
    FalseCondition,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentScam => "payment_scam",
            Self::UnauthorizedDiscount => "unauthorized_discount",
            Self::FalseCondition => "false_condition",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Block,
    Flag,
    ActiveIntervention,
}

/// One row of a safety pattern table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub violation_type: ViolationType,
    pub pattern: String,
    pub severity: Severity,
    pub action: ViolationAction,
    /// Skip the match when its sentence also contains a negation.
    #[serde(default)]
    pub suppress_on_negation: bool,
}

impl SafetyRule {
    pub fn new(
        violation_type: ViolationType,
        pattern: impl Into<String>,
        severity: Severity,
        action: ViolationAction,
    ) -> Self {
        Self { violation_type, pattern: pattern.into(), severity, action, suppress_on_negation: false }
    }

    pub fn negatable(mut self) -> Self {
        self.suppress_on_negation = true;
        self
    }
}

const PAYMENT_SCAM_PATTERNS: &[&str] = &[
    r"\bwestern\s+union\b",
    r"\bmoney\s*gram\b",
    r"\bwire\s+(?:the\s+)?(?:money|funds|transfer)\b",
    r"\b(?:bitcoin|btc|usdt|ethereum|crypto(?:currency)?)\b",
    r"\bgift\s+cards?\b",
    r"\bpay\s+(?:me\s+)?(?:in\s+)?cash\b",
    r"\bcash\s+(?:only|upfront|deposit)\b",
];

const OFF_PLATFORM_PATTERNS: &[&str] = &[
    r"\b(?:contact|call|text|message|reach)\s+me\s+(?:on|via|at|through)\s+(?:whatsapp|telegram|signal|wechat|viber|my\s+email)\b",
    r"\boutside\s+(?:of\s+)?(?:the|this)\s+platform\b",
    r"\boff[-\s]platform\b",
];

const DISCOUNT_PATTERNS: &[&str] = &[
    r"\b(?:take|knock)\s+\$?\d[\d,]*(?:\.\d+)?\s*(?:dollars?|usd)?\s+off\b",
    r"\b\d{1,3}(?:\.\d+)?\s*%\s*(?:off|discount)\b",
    r"\bdiscount\s+of\s+\$?\d[\d,]*(?:\.\d+)?\s*%?",
    r"\b(?:lower|drop|reduce)\s+the\s+price\s+(?:to|by)\b",
];

const FALSE_CONDITION_PATTERNS: &[&str] = &[
    r"\bperfect\s+condition\b",
    r"\blike\s+new\b",
    r"\bnever\s+(?:been\s+)?(?:in\s+)?(?:an?\s+)?accidents?\b",
    r"\bno\s+scratch(?:es)?\b",
    r"\bguaranteed?\s+engine\b",
    r"\bengine\s+(?:is\s+)?guaranteed\b",
];

/// Refusal phrasing that turns a discount mention into a non-concession. The refusal and the
/// concession word must share a clause, so "Not a problem, I can take $500 off" still counts.
pub const NEGATION_PATTERNS: &[&str] = &[
    r"\b(?:cannot|can't|can’t|can\s+not|won't|won’t|will\s+not|unable\s+to|not\s+able\s+to|not)\b[^.!?,;]*\b(?:discount|lower|offer)\b",
];

fn table(
    patterns: &[&str],
    violation_type: ViolationType,
    severity: Severity,
    action: ViolationAction,
) -> Vec<SafetyRule> {
    patterns
        .iter()
        .map(|pattern| SafetyRule::new(violation_type, *pattern, severity, action))
        .collect()
}

pub fn default_rules() -> Vec<SafetyRule> {
    let mut rules = table(
        PAYMENT_SCAM_PATTERNS,
        ViolationType::PaymentScam,
        Severity::High,
        ViolationAction::Block,
    );
    rules.extend(table(
        OFF_PLATFORM_PATTERNS,
        ViolationType::PaymentScam,
        Severity::High,
        ViolationAction::ActiveIntervention,
    ));
    rules.extend(
        table(
            DISCOUNT_PATTERNS,
            ViolationType::UnauthorizedDiscount,
            Severity::Medium,
            ViolationAction::Flag,
        )
        .into_iter()
        .map(SafetyRule::negatable),
    );
    rules.extend(table(
        FALSE_CONDITION_PATTERNS,
        ViolationType::FalseCondition,
        Severity::High,
        ViolationAction::Block,
    ));
    rules
}

pub fn default_negations() -> Vec<String> {
    NEGATION_PATTERNS.iter().map(|pattern| (*pattern).to_owned()).collect()
}
