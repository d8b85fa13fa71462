//! Parallel probe aggregation, grounded on `des/packer/health.py::HealthChecker`.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use des_config::MultiSourceConfig;
use des_db::SourceConnector;
use serde::Serialize;
use sqlx::postgres::PgPool;

const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    fn ok(latency: Duration) -> Self {
        ProbeResult { status: ProbeStatus::Ok, latency_ms: latency.as_millis() as u64, error: None }
    }

    fn timeout(latency: Duration) -> Self {
        ProbeResult { status: ProbeStatus::Timeout, latency_ms: latency.as_millis() as u64, error: None }
    }

    fn error(latency: Duration, message: String) -> Self {
        ProbeResult { status: ProbeStatus::Error, latency_ms: latency.as_millis() as u64, error: Some(message) }
    }

    fn is_ok(&self) -> bool {
        self.status == ProbeStatus::Ok
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardLockProbe {
    #[serde(flatten)]
    pub probe: ProbeResult,
    pub held: u32,
    pub expired: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceProvidersProbe {
    #[serde(flatten)]
    pub probe: ProbeResult,
    pub enabled: u32,
    pub connected: u32,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub failures: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub database: ProbeResult,
    pub object_store: ProbeResult,
    pub shard_locks: ShardLockProbe,
    pub source_providers: SourceProvidersProbe,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed: Option<DateTime<Utc>>,
}

impl HealthReport {
    /// Readiness policy (spec §4.L): only `healthy` is ready.
    pub fn is_ready(&self) -> bool {
        self.status == OverallStatus::Healthy
    }
}

/// Aggregates DB, object-store, shard-lock, and source-provider probes.
///
/// Shared across a process's lifetime; `record_processed` is called by the
/// packer/marker loop whenever it makes progress, so the report can surface
/// staleness even when every probe individually succeeds.
pub struct HealthChecker {
    pool: PgPool,
    s3: aws_sdk_s3::Client,
    bucket: String,
    sources: MultiSourceConfig,
    timeout: Duration,
    start_time: Instant,
    last_processed: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl HealthChecker {
    pub fn new(pool: PgPool, s3: aws_sdk_s3::Client, bucket: String, sources: MultiSourceConfig) -> Self {
        HealthChecker {
            pool,
            s3,
            bucket,
            sources,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            start_time: Instant::now(),
            last_processed: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS));
        self
    }

    pub fn record_processed(&self) {
        *self.last_processed.lock() = Some(Utc::now());
    }

    async fn check_database(&self) -> ProbeResult {
        let start = Instant::now();
        let probe = sqlx::query("SELECT 1").fetch_optional(&self.pool);
        match tokio::time::timeout(self.timeout, probe).await {
            Err(_) => ProbeResult::timeout(start.elapsed()),
            Ok(Err(e)) => ProbeResult::error(start.elapsed(), e.to_string()),
            Ok(Ok(_)) => ProbeResult::ok(start.elapsed()),
        }
    }

    async fn check_object_store(&self) -> ProbeResult {
        let start = Instant::now();
        let probe = self.s3.head_bucket().bucket(self.bucket.as_str()).send();
        match tokio::time::timeout(self.timeout, probe).await {
            Err(_) => ProbeResult::timeout(start.elapsed()),
            Ok(Err(e)) => ProbeResult::error(start.elapsed(), e.to_string()),
            Ok(Ok(_)) => ProbeResult::ok(start.elapsed()),
        }
    }

    async fn check_shard_locks(&self) -> ShardLockProbe {
        let start = Instant::now();
        let probe = async {
            let now = Utc::now();
            let held: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM des_shard_locks WHERE expires_at > $1")
                    .bind(now)
                    .fetch_one(&self.pool)
                    .await?;
            let expired: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM des_shard_locks WHERE expires_at <= $1")
                    .bind(now)
                    .fetch_one(&self.pool)
                    .await?;
            Ok::<(i64, i64), sqlx::Error>((held.0, expired.0))
        };

        match tokio::time::timeout(self.timeout, probe).await {
            Err(_) => ShardLockProbe { probe: ProbeResult::timeout(start.elapsed()), held: 0, expired: 0 },
            Ok(Err(e)) => ShardLockProbe {
                probe: ProbeResult::error(start.elapsed(), e.to_string()),
                held: 0,
                expired: 0,
            },
            Ok(Ok((held, expired))) => ShardLockProbe {
                probe: ProbeResult::ok(start.elapsed()),
                held: held as u32,
                expired: expired as u32,
            },
        }
    }

    async fn check_source_providers(&self) -> SourceProvidersProbe {
        let start = Instant::now();
        let enabled: Vec<_> = self.sources.enabled_sources().cloned().collect();
        if enabled.is_empty() {
            return SourceProvidersProbe {
                probe: ProbeResult::ok(start.elapsed()),
                enabled: 0,
                connected: 0,
                failures: Default::default(),
            };
        }

        let mut connected = 0u32;
        let mut failures = std::collections::BTreeMap::new();
        for source in &enabled {
            let name = source.name.clone();
            let result = match SourceConnector::new(&self.pool, source.clone()) {
                Ok(connector) => tokio::time::timeout(self.timeout, connector.ping()).await,
                Err(e) => Ok(Err(e)),
            };
            match result {
                Ok(Ok(())) => connected += 1,
                Ok(Err(e)) => {
                    failures.insert(name, e.to_string());
                }
                Err(_) => {
                    failures.insert(name, "timeout".to_string());
                }
            }
        }

        let status = if connected == enabled.len() as u32 { ProbeStatus::Ok } else { ProbeStatus::Error };
        SourceProvidersProbe {
            probe: ProbeResult { status, latency_ms: start.elapsed().as_millis() as u64, error: None },
            enabled: enabled.len() as u32,
            connected,
            failures,
        }
    }

    pub async fn get_health_status(&self) -> HealthReport {
        let (database, object_store, shard_locks, source_providers) = tokio::join!(
            self.check_database(),
            self.check_object_store(),
            self.check_shard_locks(),
            self.check_source_providers(),
        );

        let critical_failed = !database.is_ok() || !object_store.is_ok();
        let non_critical_issue = !shard_locks.probe.is_ok()
            || shard_locks.expired > 0
            || !source_providers.probe.is_ok()
            || source_providers.connected < source_providers.enabled;

        let status = if critical_failed {
            OverallStatus::Unhealthy
        } else if non_critical_issue {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            checks: HealthChecks { database, object_store, shard_locks, source_providers },
            uptime_seconds: self.start_time.elapsed().as_secs(),
            last_processed: *self.last_processed.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_is_healthy_only() {
        let healthy = HealthReport {
            status: OverallStatus::Healthy,
            timestamp: Utc::now(),
            checks: HealthChecks {
                database: ProbeResult::ok(Duration::from_millis(1)),
                object_store: ProbeResult::ok(Duration::from_millis(1)),
                shard_locks: ShardLockProbe { probe: ProbeResult::ok(Duration::from_millis(1)), held: 1, expired: 0 },
                source_providers: SourceProvidersProbe {
                    probe: ProbeResult::ok(Duration::from_millis(1)),
                    enabled: 0,
                    connected: 0,
                    failures: Default::default(),
                },
            },
            uptime_seconds: 10,
            last_processed: None,
        };
        assert!(healthy.is_ready());

        let mut degraded = healthy.clone();
        degraded.status = OverallStatus::Degraded;
        assert!(!degraded.is_ready());
    }
}
