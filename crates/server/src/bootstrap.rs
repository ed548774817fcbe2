use std::sync::Arc;

use exportdesk_agent::realtime::{BroadcastRealtimeChannel, RealtimeChannel, RealtimeError};
use exportdesk_agent::{AgentEventBus, JourneyService, SubscriptionHandle, WorkflowEngine};
use exportdesk_core::config::{AppConfig, ConfigError};
use exportdesk_core::tasks::{TaskEngine, TaskEngineConfig};
use exportdesk_core::workflows::WorkflowCatalog;
use exportdesk_db::repositories::{
    SqlAuditSink, SqlEventLogRepository, SqlJourneyRepository, SqlTaskRepository,
    SqlWorkflowRepository,
};
use exportdesk_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::realtime::WebhookRealtimeChannel;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub journeys: Arc<JourneyService>,
    pub bus: Arc<AgentEventBus>,
    pub engine: Arc<WorkflowEngine>,
    /// In-process event feed, present when no webhook delivery is configured.
    pub live_events: Option<Arc<BroadcastRealtimeChannel>>,
    /// Keeps the engine's task listeners registered for the life of the application.
    pub subscriptions: Vec<SubscriptionHandle>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("realtime channel setup failed: {0}")]
    Realtime(#[source] RealtimeError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let task_engine = TaskEngine::with_config(TaskEngineConfig {
        claim_timeout_seconds: i64::try_from(config.orchestration.claim_timeout_secs)
            .unwrap_or(i64::MAX),
    });

    let (realtime, live_events) =
        match WebhookRealtimeChannel::from_config(&config.realtime)
            .map_err(BootstrapError::Realtime)?
        {
            Some(webhook) => (Arc::new(webhook) as Arc<dyn RealtimeChannel>, None),
            None => {
                let live = Arc::new(BroadcastRealtimeChannel::new(
                    config.orchestration.event_channel_capacity,
                ));
                (live.clone() as Arc<dyn RealtimeChannel>, Some(live))
            }
        };
    info!(
        event_name = "system.bootstrap.realtime_channel",
        correlation_id = "bootstrap",
        channel = realtime.name(),
        "realtime channel selected"
    );

    let bus = Arc::new(
        AgentEventBus::new(
            Arc::new(SqlTaskRepository::new(db_pool.clone())),
            Arc::new(SqlEventLogRepository::new(db_pool.clone())),
            task_engine,
        )
        .with_realtime(realtime),
    );

    let journeys = Arc::new(
        JourneyService::new(
            Arc::new(SqlJourneyRepository::new(db_pool.clone())),
            Arc::new(SqlAuditSink::new(db_pool.clone())),
        )
        .with_events(Arc::clone(&bus))
        .with_max_attempts(config.orchestration.max_transition_retries),
    );

    let engine = Arc::new(
        WorkflowEngine::new(
            WorkflowCatalog::builtin(),
            Arc::new(SqlWorkflowRepository::new(db_pool.clone())),
            Arc::clone(&journeys),
            Arc::clone(&bus),
        )
        .with_max_attempts(config.orchestration.max_transition_retries),
    );
    let subscriptions = engine.attach();

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        workflows = engine.catalog().definitions().len(),
        "orchestration services wired"
    );

    Ok(Application { config, db_pool, journeys, bus, engine, live_events, subscriptions })
}
