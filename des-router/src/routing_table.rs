//! Endpoint routing with a per-endpoint circuit breaker, grounded on
//! `des/router/routing_table.py::RoutingTable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use des_config::{RetrieverEndpointConfig, RoutingStrategy};
use des_error::{make_err, Code, Error};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
struct EndpointState {
    is_healthy: bool,
    failure_count: u32,
    #[serde(skip)]
    last_failure_time: Option<Instant>,
}

impl Default for EndpointState {
    fn default() -> Self {
        EndpointState { is_healthy: true, failure_count: 0, last_failure_time: None }
    }
}

/// One retriever endpoint plus its live circuit-breaker state.
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub weight: u32,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub fn is_healthy_snapshot(&self) -> bool {
        self.state.lock().is_healthy
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }
}

pub struct RoutingTable {
    endpoints: Vec<Endpoint>,
    strategy: RoutingStrategy,
    cb_threshold: u32,
    cb_timeout: Duration,
    counter: AtomicUsize,
}

pub(crate) fn hash_first_byte(name: &str) -> u8 {
    let digest = Sha256::digest(name.as_bytes());
    digest[0]
}

impl RoutingTable {
    pub fn new(endpoints: Vec<RetrieverEndpointConfig>, strategy: RoutingStrategy, cb_threshold: u32, cb_timeout_secs: u64) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|e| Endpoint { id: e.id, url: e.url, weight: e.weight, state: Mutex::new(EndpointState::default()) })
            .collect();
        RoutingTable {
            endpoints,
            strategy,
            cb_threshold,
            cb_timeout: Duration::from_secs(cb_timeout_secs),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Re-admits an endpoint whose circuit-breaker timeout has elapsed, lazily
    /// on access (mirrors the original's `_is_healthy` self-healing check).
    fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        let mut state = endpoint.state.lock();
        if state.is_healthy {
            return true;
        }
        match state.last_failure_time {
            Some(t) if t.elapsed() > self.cb_timeout => {
                state.is_healthy = true;
                state.failure_count = 0;
                true
            }
            _ => false,
        }
    }

    fn healthy_endpoints(&self) -> Vec<&Endpoint> {
        self.endpoints.iter().filter(|e| self.is_healthy(e)).collect()
    }

    /// Bulk re-admission sweep, run before giving up when every endpoint
    /// currently looks unhealthy.
    fn reset_unhealthy(&self) {
        for endpoint in &self.endpoints {
            let mut state = endpoint.state.lock();
            if !state.is_healthy {
                if let Some(t) = state.last_failure_time {
                    if t.elapsed() > self.cb_timeout {
                        state.is_healthy = true;
                        state.failure_count = 0;
                    }
                }
            }
        }
    }

    /// Picks the target endpoint for a request. `hash_byte`, when given,
    /// short-circuits the SHA-256 computation (client precomputed it).
    pub fn get_target_retriever(&self, name: &str, hash_byte: Option<u8>) -> Result<&Endpoint, Error> {
        if self.endpoints.is_empty() {
            return Err(make_err!(Code::FailedPrecondition, "no retriever endpoints configured"));
        }

        let mut healthy = self.healthy_endpoints();
        if healthy.is_empty() {
            self.reset_unhealthy();
            healthy = self.healthy_endpoints();
        }
        if healthy.is_empty() {
            return Err(make_err!(Code::Unavailable, "no healthy retrievers available"));
        }

        match self.strategy {
            RoutingStrategy::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Ok(healthy[idx])
            }
            RoutingStrategy::Weighted => Ok(weighted_pick(&healthy, name)),
            RoutingStrategy::HashByte => {
                let byte = hash_byte.unwrap_or_else(|| hash_first_byte(name));
                let idx = byte as usize % self.endpoints.len();
                let primary = &self.endpoints[idx];
                if self.is_healthy(primary) {
                    return Ok(primary);
                }
                healthy
                    .into_iter()
                    .find(|e| e.id != primary.id)
                    .ok_or_else(|| make_err!(Code::Unavailable, "no healthy retrievers available"))
            }
        }
    }

    pub fn get_fallback_retrievers(&self, exclude: &str) -> Vec<&Endpoint> {
        self.healthy_endpoints().into_iter().filter(|e| e.id != exclude).collect()
    }

    pub fn mark_failure(&self, id: &str) {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.id == id) else { return };
        let mut state = endpoint.state.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());
        if state.failure_count >= self.cb_threshold {
            state.is_healthy = false;
        }
    }

    pub fn mark_success(&self, id: &str) {
        let Some(endpoint) = self.endpoints.iter().find(|e| e.id == id) else { return };
        let mut state = endpoint.state.lock();
        state.failure_count = 0;
        state.is_healthy = true;
        state.last_failure_time = None;
    }

    pub fn health_check_all(&self) -> BTreeMap<String, bool> {
        self.endpoints.iter().map(|e| (e.id.clone(), self.is_healthy(e))).collect()
    }
}

/// Deterministic weighted choice: hashes `name` into `[0, total_weight)` so
/// routing stays stable for a given file rather than picking randomly per call.
fn weighted_pick<'a>(healthy: &[&'a Endpoint], name: &str) -> &'a Endpoint {
    let total: u64 = healthy.iter().map(|e| e.weight.max(1) as u64).sum();
    let digest = Sha256::digest(name.as_bytes());
    let point = u64::from_be_bytes(digest[0..8].try_into().unwrap()) % total.max(1);
    let mut acc = 0u64;
    for endpoint in healthy {
        acc += endpoint.weight.max(1) as u64;
        if point < acc {
            return endpoint;
        }
    }
    healthy[healthy.len() - 1]
}
