//! HTTP surface for the transcoding daemon
//!
//! Job submission, status, cancellation and the metrics document.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::jobs::current_timestamp_ms;
use crate::metrics::{MetricsSnapshot, SharedSystemMetrics};
use crate::scheduler::{CancelOutcome, JobView, Scheduler, SchedulerError, SubmitRequest};

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub system: SharedSystemMetrics,
}

/// Scheduler errors rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::Spec(_) => StatusCode::BAD_REQUEST,
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::NotTerminal { .. } => StatusCode::CONFLICT,
            SchedulerError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Handler for GET /metrics endpoint
async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.scheduler.metrics_snapshot();
    snapshot.system = state.system.read().await.clone();
    snapshot.timestamp_unix_ms = current_timestamp_ms();
    Json(snapshot)
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.scheduler.list())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.scheduler.status(&id)?))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let id = state.scheduler.submit(request)?;
    Ok((StatusCode::CREATED, Json(state.scheduler.status(&id)?)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelOutcome>, ApiError> {
    Ok(Json(state.scheduler.cancel(&id)?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Creates the axum Router with job and metrics endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

/// Serves the router on `bind` until `shutdown` resolves.
pub async fn run_server<F>(bind: &str, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
