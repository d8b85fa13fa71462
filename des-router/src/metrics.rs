//! Prometheus metrics for the router, grounded on the `Counter`/`Histogram`
//! definitions at the top of `des/router/service.py`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RequestLabel {
    pub method: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RetrieverLabel {
    pub retriever_id: String,
}

pub struct RouterMetrics {
    pub requests: Family<RequestLabel, Counter>,
    pub retriever_failures: Family<RetrieverLabel, Counter>,
    pub latency_seconds: Histogram,
    pub retry_count: Histogram,
    pub healthy_retrievers: Gauge,
}

impl RouterMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::default();
        registry.register("des_router_requests", "Router requests", requests.clone());

        let retriever_failures = Family::default();
        registry.register("des_router_retriever_failures", "Retriever failures", retriever_failures.clone());

        let latency_seconds = Histogram::new([0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0].into_iter());
        registry.register("des_router_latency_seconds", "Router latency seconds", latency_seconds.clone());

        let retry_count = Histogram::new([0.0, 1.0, 2.0, 3.0].into_iter());
        registry.register("des_router_retry_count", "Retry attempts per request", retry_count.clone());

        let healthy_retrievers = Gauge::default();
        registry.register("des_router_healthy_retrievers", "Number of healthy retrievers", healthy_retrievers.clone());

        RouterMetrics { requests, retriever_failures, latency_seconds, retry_count, healthy_retrievers }
    }

    pub fn record_request(&self, method: &str, status: u16) {
        self.requests
            .get_or_create(&RequestLabel { method: method.to_string(), status: status.to_string() })
            .inc();
    }

    pub fn record_failure(&self, retriever_id: &str) {
        self.retriever_failures.get_or_create(&RetrieverLabel { retriever_id: retriever_id.to_string() }).inc();
    }
}
