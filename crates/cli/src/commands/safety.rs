use exportdesk_core::safety::{SafetyFilter, SafetyVerdict};
use serde_json::json;

use crate::commands::{CommandResult, EXIT_OPERATION};

/// Runs the standard safety filter over `text`. A blocked text still reports `ok` unless
/// `fail_on_block` is set.
pub fn run(text: &str, fail_on_block: bool) -> CommandResult {
    if text.trim().is_empty() {
        return CommandResult::failure("safety-check", "invalid_input", "text must not be empty", EXIT_OPERATION);
    }

    let check = SafetyFilter::standard().check_response(text);
    if fail_on_block && check.action == SafetyVerdict::Block {
        return CommandResult::failure(
            "safety-check",
            "blocked",
            format!("text blocked with {} violation(s)", check.violations.len()),
            EXIT_OPERATION,
        );
    }

    CommandResult::success_with(
        "safety-check",
        format!("verdict: {}", check.action.as_str()),
        Some(json!(check)),
    )
}
