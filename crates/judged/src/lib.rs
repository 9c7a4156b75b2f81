//! HTTP transport for the judge.
//!
//! A thin axum layer over [`JudgeService`]: header lookup, body limit, and
//! status translation through [`JudgeError::status_code`]. Everything else
//! lives in `judge-core`.

use std::future::Future;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use judge_core::readiness::check_readiness;
use judge_core::{JudgeError, JudgeService};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::debug;

/// Largest accepted `/judge` body.
pub const MAX_BODY_BYTES: usize = 1 << 20;

pub fn router(service: JudgeService) -> Router {
    Router::new()
        .route("/judge", post(judge))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(service)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    service: JudgeService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_response(err: &JudgeError) -> Response {
    (status(err.status_code()), Json(err.body())).into_response()
}

async fn judge(State(service): State<JudgeService>, headers: HeaderMap, body: Body) -> Response {
    let started = Instant::now();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "request body rejected");
            service.record_transport_rejection(started, 413);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "payload_too_large", "detail": "request body too large"})),
            )
                .into_response();
        }
    };

    let lookup = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match service.judge(lookup, &bytes).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn readyz(State(service): State<JudgeService>) -> Response {
    let report = check_readiness(service.keys(), service.replay(), service.clock().as_ref()).await;
    (status(report.status_code()), Json(report)).into_response()
}

async fn metrics(State(service): State<JudgeService>) -> Response {
    Json(service.window().summary()).into_response()
}
