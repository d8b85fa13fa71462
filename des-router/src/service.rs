//! Axum reverse-proxy surface, grounded on `des/router/service.py`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use des_config::RouterConfig;
use des_error::{make_err, Code, Error};
use serde::Deserialize;

use crate::metrics::RouterMetrics;
use crate::routing_table::{Endpoint, RoutingTable};

pub struct AppState {
    pub table: RoutingTable,
    pub client: reqwest::Client,
    pub config: RouterConfig,
    pub metrics: Arc<RouterMetrics>,
    pub registry: prometheus_client::registry::Registry,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/files/:name", get(get_file).head(head_file))
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .route("/routing-table", get(routing_table))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct HashQuery {
    hash: Option<String>,
    hash_byte: Option<String>,
}

/// Hop-by-hop headers dropped when relaying an upstream response.
const HOP_BY_HOP: [&str; 3] = ["connection", "transfer-encoding", "content-length"];

fn resolve_hash_byte(name: &str, query: &HashQuery) -> Result<u8, Error> {
    if let Some(raw) = &query.hash_byte {
        let raw = raw.trim_start_matches("0x");
        return u8::from_str_radix(raw, 16).map_err(|e| make_err!(Code::InvalidArgument, "invalid hash_byte: {e}"));
    }
    if let Some(hash) = &query.hash {
        if hash.len() < 2 {
            return Err(make_err!(Code::InvalidArgument, "hash too short"));
        }
        return u8::from_str_radix(&hash[..2], 16).map_err(|e| make_err!(Code::InvalidArgument, "invalid hash: {e}"));
    }
    Ok(crate::routing_table::hash_first_byte(name))
}

struct ProxyOutcome {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

async fn proxy_request(state: &AppState, method: &str, endpoint: &Endpoint, name: &str) -> Result<ProxyOutcome, reqwest::Error> {
    let url = format!("{}/files/{}", endpoint.url.trim_end_matches('/'), name);
    let request = if method == "GET" { state.client.get(&url) } else { state.client.head(&url) };
    let resp = request.timeout(Duration::from_secs(state.config.request_timeout_secs)).send().await?;
    let status = resp.status();
    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            headers.insert(name.clone(), value.clone());
        }
    }
    let body = if method == "GET" { resp.bytes().await? } else { Bytes::new() };
    Ok(ProxyOutcome { status, headers, body })
}

async fn route(state: &Arc<AppState>, method: &str, name: &str, hash_byte: u8) -> Result<ProxyOutcome, Error> {
    let primary = state.table.get_target_retriever(name, Some(hash_byte))?;
    let fallbacks = state.table.get_fallback_retrievers(&primary.id);
    let mut chain = vec![primary];
    chain.extend(fallbacks);

    let mut last_err: Option<String> = None;
    for (attempt, endpoint) in chain.into_iter().enumerate() {
        let attempt = attempt as u32 + 1;
        let start = Instant::now();
        match proxy_request(state, method, endpoint, name).await {
            Ok(outcome) if outcome.status.is_server_error() => {
                state.metrics.record_failure(&endpoint.id);
                state.table.mark_failure(&endpoint.id);
                last_err = Some(format!("retriever {} returned {}", endpoint.id, outcome.status));
            }
            Ok(outcome) => {
                state.metrics.latency_seconds.observe(start.elapsed().as_secs_f64());
                state.metrics.retry_count.observe((attempt - 1) as f64);
                state.table.mark_success(&endpoint.id);
                return Ok(outcome);
            }
            Err(e) => {
                state.metrics.record_failure(&endpoint.id);
                state.table.mark_failure(&endpoint.id);
                last_err = Some(e.to_string());
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt - 1).min(3));
                tokio::time::sleep(backoff).await;
            }
        }
        if attempt >= state.config.max_retries {
            break;
        }
    }

    Err(make_err!(Code::Unavailable, "{}", last_err.unwrap_or_else(|| "no retrievers available".to_string())))
}

fn error_status(e: &Error) -> StatusCode {
    match e.code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::FailedPrecondition => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[tracing::instrument(skip(state))]
async fn get_file(State(state): State<Arc<AppState>>, Path(name): Path<String>, Query(query): Query<HashQuery>) -> Response {
    let hash_byte = match resolve_hash_byte(&name, &query) {
        Ok(b) => b,
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    };
    match route(&state, "GET", &name, hash_byte).await {
        Ok(outcome) => {
            state.metrics.record_request("GET", outcome.status.as_u16());
            (outcome.status, outcome.headers, outcome.body).into_response()
        }
        Err(e) => {
            let status = error_status(&e);
            state.metrics.record_request("GET", status.as_u16());
            (status, e.to_string()).into_response()
        }
    }
}

#[tracing::instrument(skip(state))]
async fn head_file(State(state): State<Arc<AppState>>, Path(name): Path<String>, Query(query): Query<HashQuery>) -> Response {
    let hash_byte = match resolve_hash_byte(&name, &query) {
        Ok(b) => b,
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    };
    match route(&state, "HEAD", &name, hash_byte).await {
        Ok(outcome) => {
            state.metrics.record_request("HEAD", outcome.status.as_u16());
            (outcome.status, outcome.headers).into_response()
        }
        Err(e) => {
            let status = error_status(&e);
            state.metrics.record_request("HEAD", status.as_u16());
            status.into_response()
        }
    }
}

async fn liveness() -> impl IntoResponse {
    axum::Json(serde_json::json!({"status": "ok"}))
}

async fn readiness(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.table.health_check_all();
    let healthy_count = snapshot.values().filter(|ok| **ok).count();
    state.metrics.healthy_retrievers.set(healthy_count as i64);
    axum::Json(snapshot).into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.registry) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(serde::Serialize)]
struct EndpointSnapshot {
    id: String,
    url: String,
    weight: u32,
    is_healthy: bool,
    failure_count: u32,
}

async fn routing_table(State(state): State<Arc<AppState>>) -> Response {
    let endpoints: Vec<EndpointSnapshot> = state
        .table
        .endpoints()
        .iter()
        .map(|e| EndpointSnapshot {
            id: e.id.clone(),
            url: e.url.clone(),
            weight: e.weight,
            is_healthy: e.is_healthy_snapshot(),
            failure_count: e.failure_count(),
        })
        .collect();
    axum::Json(serde_json::json!({"retrievers": endpoints})).into_response()
}
