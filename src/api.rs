//! HTTP surface: probes, Prometheus scrape, producer and operator routes.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::dead_letter::DeadLetterFilter;
use crate::error::JobError;
use crate::jobs::JobFilter;
use crate::service::{JobService, SubmitRequest};

/// Build the router over a shared service. Job and dead-letter routes
/// answer 503 until startup recovery has finished; probes, `/metrics` and
/// the manual recovery trigger are always open.
pub fn routes(service: Arc<JobService>) -> Router {
    let gated = Router::new()
        .route("/api/jobs", get(list_jobs).post(submit))
        .route("/api/jobs/{id}", get(status))
        .route("/api/jobs/{id}/history", get(history))
        .route("/api/jobs/{id}/cancel", post(cancel))
        .route("/api/dead-letters", get(list_dead_letters))
        .route("/api/dead-letters/{id}", get(get_dead_letter))
        .route("/api/dead-letters/{id}/retry", post(retry_dead_letter))
        .route("/api/dead-letters/{id}/dismiss", post(dismiss_dead_letter))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&service),
            require_recovery,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api/recovery/scan", post(recovery_scan))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn job_error(e: JobError) -> Response {
    let status = match &e {
        JobError::NotFound { .. } | JobError::DeadLetterNotFound { .. } => StatusCode::NOT_FOUND,
        JobError::InvalidTransition { .. }
        | JobError::DeadLetterResolved { .. }
        | JobError::LeaseHeld { .. }
        | JobError::LeaseLost { .. }
        | JobError::Cancelled { .. }
        | JobError::CheckpointSequence { .. } => StatusCode::CONFLICT,
        JobError::NoHandler { .. } | JobError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        JobError::DuplicateHandler { .. } | JobError::Database(_) => {
            error!(error = %e, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, e.to_string())
}

fn parse_id(id: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(id).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid job ID"))
}

async fn require_recovery(
    State(service): State<Arc<JobService>>,
    request: Request,
    next: Next,
) -> Response {
    if !service.recovered() {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Startup recovery has not finished",
        );
    }
    next.run(request).await
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(service): State<Arc<JobService>>) -> impl IntoResponse {
    Json(service.health().await)
}

async fn live() -> impl IntoResponse {
    Json(json!({"live": true}))
}

async fn ready(State(service): State<Arc<JobService>>) -> impl IntoResponse {
    let report = service.health().await;
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics(State(service): State<Arc<JobService>>) -> Response {
    match service.metrics_text().await {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Metrics export failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Producer ────────────────────────────────────────────────────────────

async fn submit(
    State(service): State<Arc<JobService>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    match service.submit_request(request).await {
        Ok(id) => (StatusCode::CREATED, Json(json!({"job_id": id}))).into_response(),
        Err(e) => job_error(e),
    }
}

async fn status(State(service): State<Arc<JobService>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.status(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => job_error(e),
    }
}

async fn history(State(service): State<Arc<JobService>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.history(id).await {
        Ok(transitions) => Json(transitions).into_response(),
        Err(e) => job_error(e),
    }
}

async fn cancel(State(service): State<Arc<JobService>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.cancel(id).await {
        Ok(cancelled) => Json(json!({"cancelled": cancelled})).into_response(),
        Err(e) => job_error(e),
    }
}

async fn list_jobs(
    State(service): State<Arc<JobService>>,
    Query(filter): Query<JobFilter>,
) -> Response {
    match service.list_jobs(&filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => job_error(e),
    }
}

// ── Operator ────────────────────────────────────────────────────────────

async fn list_dead_letters(
    State(service): State<Arc<JobService>>,
    Query(filter): Query<DeadLetterFilter>,
) -> Response {
    match service.list_dead_letters(&filter).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => job_error(e),
    }
}

async fn get_dead_letter(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.dead_letter(id).await {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => job_error(e),
    }
}

async fn retry_dead_letter(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.retry_dead_letter(id).await {
        Ok(state) => Json(json!({"status": "retried", "state": state})).into_response(),
        Err(e) => job_error(e),
    }
}

async fn dismiss_dead_letter(
    State(service): State<Arc<JobService>>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match service.dismiss_dead_letter(id).await {
        Ok(entry) => Json(entry).into_response(),
        Err(e) => job_error(e),
    }
}

async fn recovery_scan(State(service): State<Arc<JobService>>) -> Response {
    match service.trigger_recovery_scan().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => job_error(e),
    }
}
