//! HTTP surface over the [`Orchestrator`].

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::events::JobEvent;
use crate::model::{FindingFilter, JobStatus, Page, Severity};
use crate::orchestrator::{Orchestrator, SubmitRequest};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest(msg) => Self::bad_request(msg),
            Error::NotFound(msg) => Self::new(StatusCode::NOT_FOUND, format!("{msg} not found")),
            Error::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            Error::Store(e) => {
                error!(error = ?e, "database operation failed");
                Self::internal("Database operation failed")
            }
            other => Self::internal(other.to_string()),
        }
    }
}

#[derive(Clone)]
struct ApiState {
    orchestrator: Orchestrator,
    api_key: Option<Arc<str>>,
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let api_key = orchestrator
        .settings()
        .api
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(Arc::from);
    let state = ApiState {
        orchestrator,
        api_key,
    };

    let api = Router::new()
        .route("/models", get(list_models))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}/status", get(status_log))
        .route("/jobs/{id}/stream", get(stream_job))
        .route("/jobs/{id}/components", get(list_components))
        .route("/jobs/{id}/findings", get(list_findings))
        .route("/jobs/{id}/findings/summary", get(findings_summary))
        .route("/jobs/{id}/scanners", get(scanner_results))
        .route("/jobs/{id}/report", get(get_report))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    orchestrator: Orchestrator,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "api listening");
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn require_api_key(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let headers = request.headers();
    let provided = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    if provided.map(str::trim) == Some(expected) {
        next.run(request).await
    } else {
        AppError::unauthorized("missing or invalid API key").into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_models(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let settings = state.orchestrator.settings();
    Json(json!({
        "default": settings.default_model,
        "models": state.orchestrator.models(),
    }))
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl ListQuery {
    fn page(&self) -> Page {
        let default = Page::default();
        Page {
            limit: self.limit.unwrap_or(default.limit),
            offset: self.offset.unwrap_or(default.offset),
        }
    }
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let jobs = state.orchestrator.list_jobs(status, query.page()).await?;
    Ok(Json(json!({ "count": jobs.len(), "jobs": jobs })))
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.job(id).await?))
}

async fn stop_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    let job = state.orchestrator.stop(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn delete_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.orchestrator.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status_log(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> AppResult<impl IntoResponse> {
    let updates = state.orchestrator.status_updates(id, query.page()).await?;
    Ok(Json(json!({ "job_id": id, "updates": updates })))
}

async fn stream_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let events = state.orchestrator.watch(id).await?;
    let stream = events.map(|event| Ok(to_sse(&event)));
    Ok(Sse::new(stream).keep_alive(default_keep_alive()))
}

fn to_sse(event: &JobEvent) -> Event {
    let name = if event.status.is_terminal() { "complete" } else { "status" };
    let base = || {
        let sse = Event::default().event(name);
        match event.seq {
            Some(seq) => sse.id(seq.to_string()),
            None => sse,
        }
    };
    match base().json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(error = %e, "failed to encode job event");
            base().data(event.status.as_str())
        }
    }
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

async fn list_components(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.components(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct FindingsQuery {
    severity: Option<String>,
    scanner: Option<String>,
    component: Option<Uuid>,
}

async fn list_findings(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(query): Query<FindingsQuery>,
) -> AppResult<impl IntoResponse> {
    let severity = query
        .severity
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase().parse::<Severity>())
        .transpose()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let filter = FindingFilter {
        severity,
        scanner: query.scanner.filter(|s| !s.is_empty()),
        component_id: query.component,
    };
    let findings = state.orchestrator.findings(id, &filter).await?;
    Ok(Json(json!({ "count": findings.len(), "findings": findings })))
}

async fn findings_summary(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.findings_summary(id).await?))
}

async fn scanner_results(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.scanner_results(id).await?))
}

async fn get_report(State(state): State<ApiState>, Path(id): Path<Uuid>) -> AppResult<Response> {
    let report = state.orchestrator.report(id).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], report.content).into_response())
}

async fn stats(State(state): State<ApiState>) -> AppResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.stats().await?))
}
