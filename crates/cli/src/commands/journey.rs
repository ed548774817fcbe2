use std::sync::Arc;

use exportdesk_agent::JourneyService;
use exportdesk_core::domain::journey::JourneyId;
use exportdesk_core::errors::ApplicationError;
use exportdesk_db::repositories::{SqlAuditSink, SqlJourneyRepository};
use serde_json::json;

use crate::commands::{
    finish, load_config, open_database, runtime, CommandResult, StepFailure, EXIT_OPERATION,
};

/// Loads a journey with its history and checks that replaying the history reproduces the
/// stored state.
pub fn run(journey_id: &str) -> CommandResult {
    let config = match load_config("journey") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("journey") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let id = JourneyId(journey_id.to_string());
    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let service = JourneyService::new(
            Arc::new(SqlJourneyRepository::new(pool.clone())),
            Arc::new(SqlAuditSink::new(pool.clone())),
        );

        let inspected = async {
            let journey = service.get_journey(&id).await?;
            let replayed = service.verify_history(&id).await;
            Ok::<_, ApplicationError>((journey, replayed))
        }
        .await;
        pool.close().await;

        inspected.map_err(|error| operation_failure(&error))
    });

    finish("journey", result, |(journey, replayed)| {
        let consistent = replayed.is_ok();
        let message = match &replayed {
            Ok(state) => format!(
                "journey {} is {} after {} transition(s); history replay matches",
                journey.id,
                state,
                journey.history.len()
            ),
            Err(error) => format!("journey {} history replay diverged: {error}", journey.id),
        };
        CommandResult::success_with(
            "journey",
            message,
            Some(json!({ "journey": journey, "replay_consistent": consistent })),
        )
    })
}

fn operation_failure(error: &ApplicationError) -> StepFailure {
    let error_class = match error {
        ApplicationError::JourneyNotFound(_) => "not_found",
        _ => "operation",
    };
    (error_class, error.to_string(), EXIT_OPERATION)
}
