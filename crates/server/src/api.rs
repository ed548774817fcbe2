use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use exportdesk_agent::{AgentEventBus, JourneyService, WorkflowEngine};
use exportdesk_core::domain::agent::{AgentEvent, AgentTask, TaskId};
use exportdesk_core::domain::journey::{DealJourney, JourneyId, JourneyTrigger};
use exportdesk_core::domain::workflow::{WorkflowId, WorkflowInstance};
use exportdesk_core::domain::Context;
use exportdesk_core::errors::{ApplicationError, InterfaceError};
use exportdesk_core::safety::{SafetyCheckResult, SafetyFilter};

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub journeys: Arc<JourneyService>,
    pub bus: Arc<AgentEventBus>,
    pub engine: Arc<WorkflowEngine>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/workflows", get(get_workflows).post(start_workflow).patch(control_workflow))
        .route("/journeys", post(create_journey))
        .route("/journeys/{journey_id}", get(get_journey))
        .route("/journeys/{journey_id}/transitions", post(transition_journey))
        .route("/tasks", get(list_pending_tasks))
        .route("/tasks/{task_id}/claim", post(claim_task))
        .route("/tasks/{task_id}/complete", post(complete_task))
        .route("/tasks/{task_id}/fail", post(fail_task))
        .route("/events", get(list_events))
        .route("/safety/check", post(safety_check))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub error: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest { message: message.into(), correlation_id: correlation_id() })
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self(InterfaceError::Conflict { message: message.into(), correlation_id: correlation_id() })
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        Self(error.into_interface(correlation_id()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                event_name = "api.request_failed",
                correlation_id = self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request_rejected",
                correlation_id = self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request rejected"
            );
        }

        let body = ApiErrorBody {
            error: self.0.user_message(),
            detail: self.0.message().to_owned(),
            correlation_id: self.0.correlation_id().to_owned(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn correlation_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub workflow_name: String,
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowResponse {
    pub workflow_id: WorkflowId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowQuery {
    pub workflow_id: Option<String>,
    pub journey_id: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowAction {
    Pause,
    Resume,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlWorkflowRequest {
    pub workflow_id: String,
    pub action: WorkflowAction,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WorkflowLookup {
    One(WorkflowInstance),
    Many(Vec<WorkflowInstance>),
}

async fn start_workflow(
    State(state): State<ApiState>,
    Json(body): Json<StartWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<StartWorkflowResponse>)> {
    let workflow_id = state.engine.start_workflow(&body.workflow_name, body.context).await?;
    Ok((StatusCode::CREATED, Json(StartWorkflowResponse { workflow_id })))
}

async fn get_workflows(
    State(state): State<ApiState>,
    Query(query): Query<WorkflowQuery>,
) -> ApiResult<Json<WorkflowLookup>> {
    if let Some(workflow_id) = query.workflow_id {
        let workflow_id = WorkflowId(workflow_id);
        let instance = state
            .engine
            .get_workflow_status(&workflow_id)
            .await?
            .ok_or(ApplicationError::WorkflowNotFound(workflow_id))?;
        return Ok(Json(WorkflowLookup::One(instance)));
    }
    if let Some(journey_id) = query.journey_id {
        let instances = state.engine.get_journey_workflows(&JourneyId(journey_id)).await?;
        return Ok(Json(WorkflowLookup::Many(instances)));
    }
    Err(ApiError::bad_request("workflowId or journeyId query parameter is required"))
}

async fn control_workflow(
    State(state): State<ApiState>,
    Json(body): Json<ControlWorkflowRequest>,
) -> ApiResult<Json<WorkflowInstance>> {
    let workflow_id = WorkflowId(body.workflow_id);
    let instance = match body.action {
        WorkflowAction::Pause => state.engine.pause_workflow(&workflow_id).await?,
        WorkflowAction::Resume => state.engine.resume_workflow(&workflow_id).await?,
    };
    Ok(Json(instance))
}

// ---------------------------------------------------------------------------
// Journeys
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CreateJourneyRequest {
    #[serde(default)]
    pub context: Context,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub trigger: String,
    pub actor: String,
    pub context: Option<Context>,
}

async fn create_journey(
    State(state): State<ApiState>,
    Json(body): Json<CreateJourneyRequest>,
) -> ApiResult<(StatusCode, Json<DealJourney>)> {
    let journey = state.journeys.create_journey(body.context).await?;
    Ok((StatusCode::CREATED, Json(journey)))
}

async fn get_journey(
    State(state): State<ApiState>,
    Path(journey_id): Path<String>,
) -> ApiResult<Json<DealJourney>> {
    Ok(Json(state.journeys.get_journey(&JourneyId(journey_id)).await?))
}

async fn transition_journey(
    State(state): State<ApiState>,
    Path(journey_id): Path<String>,
    Json(body): Json<TransitionRequest>,
) -> ApiResult<Json<DealJourney>> {
    let trigger = JourneyTrigger::parse(&body.trigger)
        .ok_or_else(|| ApiError::bad_request(format!("unknown trigger `{}`", body.trigger)))?;
    if body.actor.trim().is_empty() {
        return Err(ApiError::bad_request("actor must not be empty"));
    }

    let journey = state
        .journeys
        .transition_with_retry(&JourneyId(journey_id), trigger, &body.actor, body.context)
        .await?;
    Ok(Json(journey))
}

// ---------------------------------------------------------------------------
// Tasks and events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PendingTasksQuery {
    pub agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

async fn list_pending_tasks(
    State(state): State<ApiState>,
    Query(query): Query<PendingTasksQuery>,
) -> ApiResult<Json<Vec<AgentTask>>> {
    Ok(Json(state.bus.list_pending_tasks(query.agent.as_deref()).await?))
}

async fn claim_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> ApiResult<Json<AgentTask>> {
    let task_id = TaskId(task_id);
    match state.bus.claim_task(&task_id, &body.agent).await? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::conflict(format!("task {task_id} is not available to claim"))),
    }
}

async fn complete_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<Json<AgentTask>> {
    Ok(Json(state.bus.complete_task(&TaskId(task_id), body.result).await?))
}

async fn fail_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Json(body): Json<FailRequest>,
) -> ApiResult<Json<AgentTask>> {
    Ok(Json(state.bus.fail_task(&TaskId(task_id), body.error).await?))
}

async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<AgentEvent>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    Ok(Json(state.bus.list_events(query.event_type.as_deref(), query.since, limit).await?))
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SafetyCheckRequest {
    pub text: String,
}

async fn safety_check(Json(body): Json<SafetyCheckRequest>) -> Json<SafetyCheckResult> {
    Json(SafetyFilter::standard().check_response(&body.text))
}
