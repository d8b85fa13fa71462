//! Prometheus metrics for the packer and its crash-recovery sweeps, grounded
//! on `des/monitoring/metrics.py` (packer counters) and the metric names
//! referenced by `des/packer/recovery.py`'s `CrashRecoveryManager`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ShardLabel {
    pub shard_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RecoveryActionLabel {
    pub action: String,
}

pub struct PackerMetrics {
    pub packed_files: Family<ShardLabel, Counter>,
    pub packed_bytes: Family<ShardLabel, Counter>,
    pub shard_lock_conflicts: Family<ShardLabel, Counter>,
    pub loop_duration_seconds: Family<ShardLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub recovery_stale_claims: Counter,
    pub recovery_partial_containers: Family<RecoveryActionLabel, Counter>,
    pub recovery_expired_locks: Counter,
    pub recovery_container_integrity: Family<RecoveryActionLabel, Counter>,
}

impl PackerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let packed_files = Family::default();
        registry.register("des_packer_files_packed", "Number of files packed", packed_files.clone());

        let packed_bytes = Family::default();
        registry.register("des_packer_bytes_packed", "Total bytes packed", packed_bytes.clone());

        let shard_lock_conflicts = Family::default();
        registry.register(
            "des_shard_lock_conflicts",
            "Shard lock acquisition conflicts",
            shard_lock_conflicts.clone(),
        );

        let loop_duration_seconds = Family::default();
        registry.register(
            "des_packer_loop_duration_seconds",
            "Duration of packer loop iteration per shard",
            loop_duration_seconds.clone(),
        );

        let recovery_stale_claims = Counter::default();
        registry.register(
            "des_recovery_stale_claims",
            "Stale source-file claims released",
            recovery_stale_claims.clone(),
        );

        let recovery_partial_containers = Family::default();
        registry.register(
            "des_recovery_partial_containers",
            "Actions taken on containers stuck in writing state",
            recovery_partial_containers.clone(),
        );

        let recovery_expired_locks = Counter::default();
        registry.register(
            "des_recovery_expired_locks",
            "Expired shard locks released",
            recovery_expired_locks.clone(),
        );

        let recovery_container_integrity = Family::default();
        registry.register(
            "des_recovery_container_integrity",
            "Outcomes of the container integrity sweep",
            recovery_container_integrity.clone(),
        );

        PackerMetrics {
            packed_files,
            packed_bytes,
            shard_lock_conflicts,
            loop_duration_seconds,
            recovery_stale_claims,
            recovery_partial_containers,
            recovery_expired_locks,
            recovery_container_integrity,
        }
    }
}
