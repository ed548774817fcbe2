use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use exportdesk_agent::AgentEventBus;
use exportdesk_db::DbPool;

/// Task completion and failure listeners registered by the workflow engine.
const ENGINE_LISTENERS: usize = 2;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    bus: Arc<AgentEventBus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

impl HealthCheck {
    fn ready(detail: impl Into<String>) -> Self {
        Self { status: "ready", detail: detail.into() }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self { status: "degraded", detail: detail.into() }
    }

    fn is_ready(&self) -> bool {
        self.status == "ready"
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub orchestration: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, bus: Arc<AgentEventBus>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, bus })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let orchestration = orchestration_check(&state.bus);
    let ready = database.is_ready() && orchestration.is_ready();

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        orchestration,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck::ready("database probe succeeded"),
        Err(error) => HealthCheck::degraded(format!("database probe failed: {error}")),
    }
}

fn orchestration_check(bus: &AgentEventBus) -> HealthCheck {
    let listeners = bus.subscriber_count();
    if listeners >= ENGINE_LISTENERS {
        HealthCheck::ready(format!("{listeners} bus subscribers attached"))
    } else {
        HealthCheck::degraded("workflow engine is not listening for task signals")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};

    use exportdesk_agent::{handler_fn, AgentEventBus, SubscriptionHandle};
    use exportdesk_core::domain::agent::{event_types, AgentEvent};
    use exportdesk_core::tasks::TaskEngine;
    use exportdesk_db::connect_with_settings;
    use exportdesk_db::repositories::{InMemoryEventLogRepository, InMemoryTaskRepository};

    use crate::health::{health, HealthState};

    fn bus_with_listeners() -> (Arc<AgentEventBus>, Vec<SubscriptionHandle>) {
        let bus = Arc::new(AgentEventBus::new(
            Arc::new(InMemoryTaskRepository::default()),
            Arc::new(InMemoryEventLogRepository::default()),
            TaskEngine::new(),
        ));
        let handles = [event_types::TASK_COMPLETED, event_types::TASK_FAILED]
            .into_iter()
            .map(|event_type| bus.subscribe(event_type, handler_fn(|_event: AgentEvent| async {})))
            .collect();
        (bus, handles)
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_and_listeners_are_up() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let (bus, _handles) = bus_with_listeners();

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool.clone(), bus })).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.orchestration.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;
        let (bus, _handles) = bus_with_listeners();

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool, bus })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.orchestration.status, "ready");
    }

    #[tokio::test]
    async fn health_is_degraded_without_engine_listeners() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let (bus, handles) = bus_with_listeners();
        for handle in &handles {
            bus.unsubscribe(handle);
        }

        let (status, Json(payload)) = health(State(HealthState { db_pool: pool.clone(), bus })).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.orchestration.status, "degraded");

        pool.close().await;
    }
}
