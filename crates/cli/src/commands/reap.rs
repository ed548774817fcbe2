use std::sync::Arc;

use chrono::Utc;
use exportdesk_agent::{AgentEventBus, JourneyService, WorkflowEngine};
use exportdesk_core::domain::workflow::StepOutcome;
use exportdesk_core::errors::ApplicationError;
use exportdesk_core::tasks::{TaskEngine, TaskEngineConfig, CLAIM_TIMEOUT_ERROR};
use exportdesk_core::workflows::WorkflowCatalog;
use exportdesk_db::repositories::{
    SqlAuditSink, SqlEventLogRepository, SqlJourneyRepository, SqlTaskRepository,
    SqlWorkflowRepository,
};
use exportdesk_db::DbPool;
use serde_json::json;

use crate::commands::{
    finish, load_config, open_database, runtime, CommandResult, EXIT_OPERATION,
};

/// One sweep of the stale-claim reaper. Owning workflows are failed in the same run, since
/// no engine listener outlives the command.
pub fn run() -> CommandResult {
    let config = match load_config("reap") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("reap") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let claim_timeout_seconds =
        i64::try_from(config.orchestration.claim_timeout_secs).unwrap_or(i64::MAX);
    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let swept = sweep(&pool, claim_timeout_seconds).await;
        pool.close().await;
        swept.map_err(|error| ("operation", error.to_string(), EXIT_OPERATION))
    });

    finish("reap", result, |(reaped, workflows_failed)| {
        CommandResult::success_with(
            "reap",
            format!(
                "reaped {} stale claim(s); {} workflow(s) failed",
                reaped.len(),
                workflows_failed
            ),
            Some(json!({ "task_ids": reaped, "workflows_failed": workflows_failed })),
        )
    })
}

async fn sweep(
    pool: &DbPool,
    claim_timeout_seconds: i64,
) -> Result<(Vec<String>, usize), ApplicationError> {
    let bus = Arc::new(AgentEventBus::new(
        Arc::new(SqlTaskRepository::new(pool.clone())),
        Arc::new(SqlEventLogRepository::new(pool.clone())),
        TaskEngine::with_config(TaskEngineConfig { claim_timeout_seconds }),
    ));
    let journeys = Arc::new(
        JourneyService::new(
            Arc::new(SqlJourneyRepository::new(pool.clone())),
            Arc::new(SqlAuditSink::new(pool.clone())),
        )
        .with_events(Arc::clone(&bus)),
    );
    let engine = WorkflowEngine::new(
        WorkflowCatalog::builtin(),
        Arc::new(SqlWorkflowRepository::new(pool.clone())),
        journeys,
        Arc::clone(&bus),
    );

    let reaped = bus.reap_stale_tasks(Utc::now()).await?;
    let mut workflows_failed = 0;
    for task_id in &reaped {
        let task = bus.get_task(task_id).await?;
        let Some(workflow_id) = task.workflow_id else {
            continue;
        };
        let outcome = StepOutcome::Failed {
            task_id: task.id,
            error: task.error.unwrap_or_else(|| CLAIM_TIMEOUT_ERROR.to_string()),
        };
        let instance = engine.handle_step_outcome(&workflow_id, outcome).await?;
        if instance.status.is_terminal() {
            workflows_failed += 1;
        }
    }

    Ok((reaped.into_iter().map(|id| id.0).collect(), workflows_failed))
}
