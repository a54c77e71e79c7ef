//! Route handlers for the Operator HTTP API (spec.md §6). Each handler is a
//! thin adapter over `man-store`/`man-policy`/`man-orchestrator`; none of
//! them perform business logic (spec.md §4.7). Grounded on
//! `tandem-server::http`'s handler shape: `State(state): State<AppState>`
//! extractors, `Json<...>` bodies, `json!({...})` responses.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use man_orchestrator::ForceManModeScope;
use man_store::Filters;
use man_types::{ManDecisionPayload, ManPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::AppState;

/// Every non-2xx response carries `{detail: string}` (spec.md §6), not the
/// `{error, code}` shape the teacher's `ErrorEnvelope` uses — the external
/// contract here is the spec's, the adapter pattern (a typed error that
/// implements `IntoResponse`) is the teacher's.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let expirer_tasks = state.tasks.clone();
    let expirer_registry = state.registry.clone();
    let expirer = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let default_ttl = chrono::Duration::minutes(1440);
            match expirer_tasks.expire_overdue(|_tenant_id| default_ttl, chrono::Utc::now()).await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::info!(count = expired.len(), "ttl-expirer: promoted overdue tasks to EXPIRED");
                    for task in expired {
                        expirer_registry.notify_expired(task.id).await;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "ttl-expirer sweep failed"),
            }
        }
    });

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    expirer.abort();
    result?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/goals", post(submit_goal))
        .route("/api/v1/man/tasks", get(list_tasks))
        .route("/api/v1/man/tasks/{id}", get(get_task))
        .route("/api/v1/man/tasks/{id}/decision", post(submit_decision))
        .route("/api/v1/man/policies", get(list_policies).put(upsert_policy))
        .route("/api/v1/workflows/{id}/pause", post(pause_workflow))
        .route("/api/v1/workflows/{id}/resume", post(resume_workflow))
        .route("/api/v1/workflows/{id}/cancel", post(cancel_workflow))
        .route("/api/v1/workflows/{id}/force-man-mode", post(force_man_mode))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SubmitGoalInput {
    user_id: String,
    user_intent: String,
    #[serde(default)]
    trace_id: Option<String>,
    /// Not part of the spec.md §6 request body, but `ActionIntent` demands a
    /// `tenant_id` for every step it triages; exposed here as an optional
    /// field defaulting to "default" (see DESIGN.md Open Question notes).
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    workflow_key: Option<String>,
}

async fn submit_goal(State(state): State<AppState>, Json(input): Json<SubmitGoalInput>) -> ApiResult<impl IntoResponse> {
    if let Some(trace_id) = &input.trace_id {
        tracing::info!(trace_id, "submit_goal received");
    }
    let tenant_id = input.tenant_id.unwrap_or_else(|| "default".to_string());
    let workflow_id = state
        .registry
        .submit_goal(state.deps.clone(), tenant_id, input.user_id, input.user_intent, input.workflow_key)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({ "workflowId": workflow_id, "status": "running" })))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    tenant_id: Option<String>,
    status: Option<String>,
    workflow_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListTasksQuery>) -> ApiResult<impl IntoResponse> {
    let mut filters = Filters::new();
    if let Some(tenant_id) = query.tenant_id {
        filters.insert("tenant_id".to_string(), Value::String(tenant_id));
    }
    if let Some(status) = query.status {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(workflow_id) = query.workflow_id {
        filters.insert("workflow_id".to_string(), Value::String(workflow_id));
    }
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);

    let (tasks, total) = state.tasks.list(filters, limit, offset).await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "tasks": tasks, "total": total, "offset": offset, "limit": limit })))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let task = state
        .tasks
        .get(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    let decision_events = man_store::list_decision_events(state.store.as_ref(), id).await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "task": task, "decision_events": decision_events })))
}

/// Records the decision in the store, then forwards it to the in-process
/// workflow coordinator if this replica happens to host it (spec.md §6: "on
/// workflow-update failure while store succeeded, return 202 and rely on
/// the next scheduler poll to converge"). A replica that doesn't host the
/// workflow can't deliver the update directly, which is exactly the 202 case.
async fn submit_decision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ManDecisionPayload>,
) -> ApiResult<Response> {
    let existing = state
        .tasks
        .get(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;

    let resolved = state.tasks.resolve(id, payload.clone()).await.map_err(ApiError::internal)?;

    let body = Json(json!({ "status": "decision_submitted", "task_id": id }));
    match state.registry.get(&resolved.workflow_id).await {
        Some(entry) => {
            entry.coordinator.submit_man_decision(id, payload).await;
            Ok((StatusCode::OK, body).into_response())
        }
        None => {
            let _ = existing;
            Ok((StatusCode::ACCEPTED, body).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyQuery {
    tenant_id: Option<String>,
    workflow_key: Option<String>,
}

async fn list_policies(State(state): State<AppState>, Query(query): Query<PolicyQuery>) -> ApiResult<impl IntoResponse> {
    let rows = man_store::list_policy_rows(state.store.as_ref(), query.tenant_id.as_deref(), query.workflow_key.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "policies": rows })))
}

#[derive(Debug, Deserialize)]
struct PolicyUpsertQuery {
    tenant_id: Option<String>,
    workflow_key: Option<String>,
    updated_by: String,
}

async fn upsert_policy(
    State(state): State<AppState>,
    Query(query): Query<PolicyUpsertQuery>,
    Json(policy): Json<ManPolicy>,
) -> ApiResult<impl IntoResponse> {
    if !policy.thresholds_valid() {
        return Err(ApiError::bad_request("yellow threshold must be <= red threshold"));
    }

    let stored = state
        .deps
        .policy
        .upsert(query.tenant_id.as_deref(), query.workflow_key.as_deref(), policy.clone())
        .await
        .map_err(ApiError::internal)?;

    let version = state.policy_version.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    man_store::upsert_with_audit(
        state.store.as_ref(),
        query.tenant_id.as_deref(),
        query.workflow_key.as_deref(),
        &stored,
        &query.updated_by,
        version,
    )
    .await
    .map_err(ApiError::internal)?;

    Ok(Json(json!({ "policy": stored })))
}

#[derive(Debug, Deserialize, Default)]
struct SignalInput {
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

async fn pause_workflow(State(state): State<AppState>, Path(id): Path<String>, body: Option<Json<SignalInput>>) -> ApiResult<impl IntoResponse> {
    let _ = body;
    if !state.registry.pause(&id).await {
        return Err(ApiError::not_found(format!("workflow {id} not found")));
    }
    Ok(Json(json!({ "status": "ok", "signal": "paused" })))
}

async fn resume_workflow(State(state): State<AppState>, Path(id): Path<String>, body: Option<Json<SignalInput>>) -> ApiResult<impl IntoResponse> {
    let _ = body;
    if !state.registry.resume(&id).await {
        return Err(ApiError::not_found(format!("workflow {id} not found")));
    }
    Ok(Json(json!({ "status": "ok", "signal": "resumed" })))
}

async fn cancel_workflow(State(state): State<AppState>, Path(id): Path<String>, body: Option<Json<SignalInput>>) -> ApiResult<impl IntoResponse> {
    let _ = body;
    if !state.registry.cancel(&id).await {
        return Err(ApiError::not_found(format!("workflow {id} not found")));
    }
    Ok(Json(json!({ "status": "ok", "signal": "cancelled" })))
}

#[derive(Debug, Deserialize)]
struct ForceManModeInput {
    scope: ForceManModeScope,
    #[serde(default)]
    step_ids: Vec<String>,
}

async fn force_man_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ForceManModeInput>,
) -> ApiResult<impl IntoResponse> {
    if !state.registry.force_man_mode(&id, input.scope, input.step_ids.clone()).await {
        return Err(ApiError::not_found(format!("workflow {id} not found")));
    }
    Ok(Json(json!({ "scope": input.scope, "step_ids": input.step_ids })))
}
