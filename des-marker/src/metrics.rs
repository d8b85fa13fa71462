//! Prometheus metrics for the marker worker, grounded on
//! `des/monitoring/marker_metrics.py`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ErrorTypeLabel {
    pub error_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct AttemptLabel {
    pub attempt: String,
}

pub struct MarkerMetrics {
    pub entries_marked: Family<StatusLabel, Counter>,
    pub errors: Family<ErrorTypeLabel, Counter>,
    pub retries: Family<AttemptLabel, Counter>,
    pub dlq_entries: Counter,
    pub batch_size: Gauge,
    pub rate_limit_ops_per_sec: Gauge,
    pub batch_duration_seconds: Histogram,
    pub entry_latency_ms: Histogram,
}

impl MarkerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let entries_marked = Family::default();
        registry.register(
            "des_marker_entries_marked",
            "Total number of catalog entries marked",
            entries_marked.clone(),
        );

        let errors = Family::default();
        registry.register("des_marker_errors", "Total number of marking errors", errors.clone());

        let retries = Family::default();
        registry.register("des_marker_retries", "Total number of retry attempts", retries.clone());

        let dlq_entries = Counter::default();
        registry.register(
            "des_marker_dlq_entries",
            "Entries sent to dead letter queue",
            dlq_entries.clone(),
        );

        let batch_size = Gauge::default();
        registry.register("des_marker_batch_size", "Current batch size setting", batch_size.clone());

        let rate_limit_ops_per_sec = Gauge::default();
        registry.register(
            "des_marker_rate_limit_ops_per_sec",
            "Current rate limit (ops/sec)",
            rate_limit_ops_per_sec.clone(),
        );

        let batch_duration_seconds = Histogram::new([0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0].into_iter());
        registry.register(
            "des_marker_batch_duration_seconds",
            "Time to process one batch",
            batch_duration_seconds.clone(),
        );

        let entry_latency_ms = Histogram::new([1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0].into_iter());
        registry.register(
            "des_marker_entry_latency_ms",
            "Time to mark a single entry",
            entry_latency_ms.clone(),
        );

        MarkerMetrics {
            entries_marked,
            errors,
            retries,
            dlq_entries,
            batch_size,
            rate_limit_ops_per_sec,
            batch_duration_seconds,
            entry_latency_ms,
        }
    }
}
