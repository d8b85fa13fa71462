//! Prometheus metrics for the retriever HTTP service, grounded on the
//! `Counter`/`Histogram` definitions at the top of `des/retriever/service.py`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RequestLabel {
    pub method: String,
    pub status: String,
}

pub struct RetrieverMetrics {
    pub requests: Family<RequestLabel, Counter>,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub store_latency_seconds: Histogram,
    pub file_size_bytes: Histogram,
}

impl RetrieverMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::default();
        registry.register("des_retriever_requests", "Retriever requests", requests.clone());

        let cache_hits = Counter::default();
        registry.register("des_retriever_cache_hits", "Index cache hits", cache_hits.clone());

        let cache_misses = Counter::default();
        registry.register("des_retriever_cache_misses", "Index cache misses", cache_misses.clone());

        let store_latency_seconds =
            Histogram::new([0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0].into_iter());
        registry.register(
            "des_retriever_store_latency_seconds",
            "Object-store request latency",
            store_latency_seconds.clone(),
        );

        let file_size_bytes = Histogram::new(
            [512.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0].into_iter(),
        );
        registry.register(
            "des_retriever_file_size_bytes",
            "Served file size in bytes",
            file_size_bytes.clone(),
        );

        RetrieverMetrics {
            requests,
            cache_hits,
            cache_misses,
            store_latency_seconds,
            file_size_bytes,
        }
    }

    pub fn record(&self, method: &str, status: u16) {
        self.requests
            .get_or_create(&RequestLabel { method: method.to_string(), status: status.to_string() })
            .inc();
    }
}
