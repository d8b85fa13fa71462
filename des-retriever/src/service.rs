//! Axum HTTP surface, grounded on `des/retriever/service.py`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use des_error::{Code, Error};
use des_health::HealthChecker;

use crate::file_handler::{FileHandler, FileInfo};
use crate::metrics::RetrieverMetrics;

pub struct AppState {
    pub handler: FileHandler,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<RetrieverMetrics>,
    pub registry: prometheus_client::registry::Registry,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/files/:name", get(get_file).head(head_file))
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn diagnostic_headers(info: &FileInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-DES-Container", HeaderValue::from_str(&info.container).unwrap_or(HeaderValue::from_static("")));
    headers.insert("X-DES-Shard-Id", HeaderValue::from_str(&info.shard_id.to_string()).unwrap());
    headers.insert("X-DES-Size-Bytes", HeaderValue::from_str(&info.size.to_string()).unwrap());
    headers.insert("X-DES-Is-External", HeaderValue::from_static(if info.is_external { "true" } else { "false" }));
    headers
}

fn error_status(e: &Error) -> StatusCode {
    match e.code {
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[tracing::instrument(skip(state))]
async fn get_file(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.handler.get_file(&name).await {
        Ok((content, info)) => {
            state.metrics.record("GET", 200);
            let mut headers = diagnostic_headers(&info);
            headers.insert("content-type", HeaderValue::from_static("application/octet-stream"));
            (StatusCode::OK, headers, content).into_response()
        }
        Err(e) => {
            let status = error_status(&e);
            state.metrics.record("GET", status.as_u16());
            (status, e.to_string()).into_response()
        }
    }
}

#[tracing::instrument(skip(state))]
async fn head_file(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.handler.file_exists(&name).await {
        Ok(Some(info)) => {
            state.metrics.record("HEAD", 200);
            (StatusCode::OK, diagnostic_headers(&info)).into_response()
        }
        Ok(None) => {
            state.metrics.record("HEAD", 404);
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            let status = error_status(&e);
            state.metrics.record("HEAD", status.as_u16());
            status.into_response()
        }
    }
}

async fn liveness() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health.get_health_status().await;
    if report.is_ready() {
        (StatusCode::OK, axum::Json(serde_json::json!({"status": "ready"}))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, axum::Json(report)).into_response()
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.registry) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
