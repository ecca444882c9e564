//! REST surface over the orchestration core.
//!
//! Thin handlers only: authorization identity arrives in gateway-set
//! headers, bodies map straight onto the service/coordinator/bulk calls,
//! and the error taxonomy translates to status codes with a structured
//! reason body.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::{BulkError, Error, ExecutionError, TaskError, TransportError};
use crate::events::EventHub;
use crate::exec::{BulkOrchestrator, ExecutionCoordinator};
use crate::store::Store;
use crate::tasks::model::{ExecutionMode, TaskStatus};
use crate::tasks::service::{NewTask, TaskPatch, TaskService};
use crate::tasks::Actor;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub bulk: Arc<BulkOrchestrator>,
    pub hub: Arc<EventHub>,
    pub store: Arc<dyn Store>,
}

/// Build the REST router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/dependencies", post(add_dependency))
        .route("/api/tasks/{id}/dependents", get(dependents))
        .route("/api/tasks/{id}/execute", post(execute_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/retry", post(retry_execution))
        .route("/api/prompt", post(execute_prompt))
        .route("/api/tasks/bulk/cancel", post(bulk_cancel))
        .route("/api/tasks/bulk/delete", post(bulk_delete))
        .route("/api/tasks/bulk/status", post(bulk_set_status))
        .route("/api/tasks/bulk/execute", post(bulk_execute))
        .route("/api/tasks/bulk/retry", post(bulk_retry))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Identity resolved by the (external) auth gateway.
fn actor_from(headers: &HeaderMap) -> Actor {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("default")
            .to_string()
    };
    Actor {
        user_id: header("x-user-id"),
        org_id: header("x-org-id"),
    }
}

/// Error wrapper translating the taxonomy to HTTP statuses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Task(TaskError::NotFound { .. })
            | Error::Execution(ExecutionError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Task(
                TaskError::InvalidTransition { .. }
                | TaskError::NotExecutable { .. }
                | TaskError::NotReady { .. }
                | TaskError::CyclicDependency { .. },
            )
            | Error::Execution(ExecutionError::NotFailed { .. }) => StatusCode::CONFLICT,
            Error::Task(
                TaskError::UnknownDependency { .. }
                | TaskError::InvalidSchedule { .. }
                | TaskError::ImmutableField { .. },
            )
            | Error::Bulk(BulkError::NoEligibleItems) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Bulk(BulkError::BatchTooLarge { .. }) => StatusCode::BAD_REQUEST,
            Error::Transport(TransportError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Task CRUD ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    server_id: String,
    agent_id: String,
    title: String,
    prompt: String,
    #[serde(default = "default_mode")]
    execution_mode: ExecutionMode,
    #[serde(default)]
    depends_on: Vec<Uuid>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Immediate
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let task = state
        .service
        .create_task(
            &actor,
            NewTask {
                server_id: body.server_id,
                agent_id: body.agent_id,
                title: body.title,
                prompt: body.prompt,
                execution_mode: body.execution_mode,
                depends_on: body.depends_on,
                schedule: body.schedule,
                scheduled_at: body.scheduled_at,
                max_retries: body.max_retries,
                retry_delay_ms: body.retry_delay_ms,
                timeout_ms: body.timeout_ms,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    status: Option<TaskStatus>,
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let tasks = state.service.list_tasks(&actor, query.status).await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.service.get_task(&actor, id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn update_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let task = state
        .service
        .update_task(
            &actor,
            id,
            TaskPatch {
                title: body.title,
                prompt: body.prompt,
                schedule: body.schedule,
                scheduled_at: body.scheduled_at,
                max_retries: body.max_retries,
                retry_delay_ms: body.retry_delay_ms,
                timeout_ms: body.timeout_ms,
            },
        )
        .await?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    state.service.delete_task(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Dependencies ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AddDependencyRequest {
    dependency_id: Uuid,
}

async fn add_dependency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<AddDependencyRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let task = state
        .service
        .add_dependency(&actor, id, body.dependency_id)
        .await?;
    Ok(Json(task))
}

async fn dependents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.service.dependents(&actor, id).await?))
}

// ── Execution ───────────────────────────────────────────────────────────

async fn execute_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let execution = state.coordinator.execute_task(id, &actor).await?;
    Ok(Json(execution))
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let task = state.coordinator.cancel_task(id, &actor).await?;
    Ok(Json(task))
}

async fn list_executions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.service.list_executions(&actor, id).await?))
}

async fn get_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.service.get_execution(&actor, id).await?))
}

async fn retry_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    let execution = state.coordinator.retry_execution(id, &actor).await?;
    Ok(Json(execution))
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    server_id: String,
    agent_id: String,
    prompt: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn execute_prompt(
    State(state): State<AppState>,
    Json(body): Json<PromptRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .coordinator
        .execute_prompt(
            &body.server_id,
            &body.agent_id,
            &body.prompt,
            body.session_id.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({
        "output": outcome.output,
        "tokens_used": outcome.tokens_used,
        "exit_code": outcome.exit_code,
        "error": outcome.error,
    })))
}

// ── Bulk operations ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BulkIdsRequest {
    ids: Vec<Uuid>,
}

async fn bulk_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkIdsRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.bulk.bulk_cancel(body.ids, &actor).await?))
}

#[derive(Debug, Deserialize)]
struct BulkDeleteRequest {
    ids: Vec<Uuid>,
    #[serde(default)]
    force: bool,
}

async fn bulk_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkDeleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(
        state.bulk.bulk_delete(body.ids, body.force, &actor).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct BulkStatusRequest {
    ids: Vec<Uuid>,
    status: TaskStatus,
}

async fn bulk_set_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(
        state
            .bulk
            .bulk_set_status(body.ids, body.status, &actor)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct BulkExecuteRequest {
    ids: Vec<Uuid>,
    #[serde(default)]
    sequential: bool,
}

async fn bulk_execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(
        state
            .bulk
            .bulk_execute(body.ids, body.sequential, &actor)
            .await?,
    ))
}

async fn bulk_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BulkIdsRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = actor_from(&headers);
    Ok(Json(state.bulk.bulk_retry(body.ids, &actor).await?))
}
