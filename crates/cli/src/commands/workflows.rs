use exportdesk_core::workflows::WorkflowCatalog;
use serde_json::json;

use crate::commands::CommandResult;

/// Lists the built-in workflow definitions with their expected context keys and steps.
pub fn run() -> CommandResult {
    let catalog = WorkflowCatalog::builtin();
    let definitions = catalog.definitions();
    let names: Vec<&str> = definitions.iter().map(|definition| definition.name).collect();

    CommandResult::success_with(
        "workflows",
        format!("{} workflow definitions: {}", definitions.len(), names.join(", ")),
        Some(json!(definitions)),
    )
}
