//! Marker worker loop: claims unmarked catalog rows, assigns them DES names
//! and shard ids, retries transient failures, and escalates permanent ones
//! to the dead-letter queue. Grounded on
//! `des/marker/advanced_marker.py::AdvancedFileMarker`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use des_assign::{SnowflakeNameConfig, SnowflakeNameGenerator};
use des_config::MarkerConfig;
use des_db::{CatalogEntry, DeadLetterQueue, SourceCatalogTable};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::metrics::{AttemptLabel, ErrorTypeLabel, MarkerMetrics, StatusLabel};
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::shutdown::Shutdown;

#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub batch_id: String,
    pub successful: u32,
    pub failed: u32,
    pub retried: u32,
    pub skipped: u32,
}

impl BatchStats {
    fn total_processed(&self) -> u32 {
        self.successful + self.failed
    }
}

/// Substring classification of transient vs. permanent failures, mirroring
/// `_is_retryable_error` in the original marker.
fn is_retryable_error(message: &str) -> bool {
    const RETRYABLE: [&str; 5] = ["timeout", "connection", "deadlock", "lock", "temporary"];
    let lower = message.to_lowercase();
    RETRYABLE.iter().any(|kw| lower.contains(kw))
}

/// Outcome of one attempt to mark a single catalog row.
enum MarkOutcome {
    Success,
    /// Transient failure; carries the message so exhaustion can still
    /// record a meaningful `last_error` on the catalog row and DLQ entry.
    Retryable(String),
}

pub struct MarkerWorker {
    pool: PgPool,
    config: MarkerConfig,
    generator: SnowflakeNameGenerator,
    rate_limiter: Option<TokenBucketRateLimiter>,
    metrics: Arc<MarkerMetrics>,
    pub shutdown: Arc<Shutdown>,
}

impl MarkerWorker {
    pub fn new(pool: PgPool, config: MarkerConfig, metrics: Arc<MarkerMetrics>) -> Result<Self, des_error::Error> {
        let generator = SnowflakeNameGenerator::new(SnowflakeNameConfig {
            node_id: config.node.node_id,
            wrap_bits: config.node.wrap_bits,
            prefix: "DES".to_string(),
        })?;

        let rate_limiter = if config.rate_per_sec > 0.0 {
            metrics.rate_limit_ops_per_sec.set(config.rate_per_sec.round() as i64);
            Some(TokenBucketRateLimiter::new(config.rate_per_sec, config.capacity))
        } else {
            metrics.rate_limit_ops_per_sec.set(0);
            None
        };
        metrics.batch_size.set(config.batch_size as i64);

        Ok(MarkerWorker {
            pool,
            config,
            generator,
            rate_limiter,
            metrics,
            shutdown: Arc::new(Shutdown::new()),
        })
    }

    fn compute_hash(name: &str) -> String {
        let digest = Sha256::digest(name.as_bytes());
        hex::encode(digest)
    }

    async fn mark_single_entry(&self, entry: &CatalogEntry, table: &SourceCatalogTable<'_>) -> Result<MarkOutcome, des_error::Error> {
        let start = Instant::now();

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(1.0).await;
        }

        let name = self.generator.next_name(None);
        let hash = Self::compute_hash(&name);
        let shard_id = des_assign::consistent_hash(&name, self.config.node.shard_bits)?;

        let result = table.mark_success(entry.id, &name, &hash, shard_id as i32).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.entry_latency_ms.observe(latency_ms);

        match result {
            Ok(()) => {
                self.metrics
                    .entries_marked
                    .get_or_create(&StatusLabel { status: "success".into() })
                    .inc();
                Ok(MarkOutcome::Success)
            }
            Err(e) => {
                let message = e.to_string();
                self.metrics
                    .errors
                    .get_or_create(&ErrorTypeLabel { error_type: e.code.to_string() })
                    .inc();
                if is_retryable_error(&message) {
                    table.mark_retry(entry.id, &message).await?;
                    Ok(MarkOutcome::Retryable(message))
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn mark_batch_with_retry(&self) -> Result<BatchStats, des_error::Error> {
        let batch_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let mut stats = BatchStats { batch_id: batch_id.clone(), ..Default::default() };
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.max_age_secs as i64);
        let start = Instant::now();

        let table = SourceCatalogTable::new(&self.pool);
        let entries = table.select_candidates(cutoff, self.config.batch_size as i64).await?;

        if entries.is_empty() {
            stats.skipped = self.config.batch_size;
            return Ok(stats);
        }

        for entry in &entries {
            if self.shutdown.is_set() {
                tracing::info!(batch_id = %batch_id, "shutdown observed mid-batch");
                break;
            }

            let mut marked = false;
            let mut last_retryable_message: Option<String> = None;
            for attempt in 1..=self.config.retry.max_retries {
                match self.mark_single_entry(entry, &table).await {
                    Ok(MarkOutcome::Success) => {
                        marked = true;
                        stats.successful += 1;
                        break;
                    }
                    Ok(MarkOutcome::Retryable(message)) => {
                        last_retryable_message = Some(message);
                        if attempt < self.config.retry.max_retries {
                            self.metrics
                                .retries
                                .get_or_create(&AttemptLabel { attempt: attempt.to_string() })
                                .inc();
                            stats.retried += 1;
                            tokio::time::sleep(self.config.retry.base_delay(attempt)).await;
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        table.mark_failed(entry.id, &message).await?;
                        DeadLetterQueue::new(&self.pool)
                            .insert(entry.id, &message, self.config.retry.max_retries as i32)
                            .await?;
                        self.metrics.dlq_entries.inc();
                        stats.failed += 1;
                        marked = true;
                        break;
                    }
                }
            }
            // Retries exhausted on a persistently transient error (e.g. a lock
            // that never clears): escalate exactly like a permanent failure.
            if !marked {
                let message = last_retryable_message
                    .unwrap_or_else(|| "exhausted retries with no successful attempt".to_string());
                table.mark_failed(entry.id, &message).await?;
                DeadLetterQueue::new(&self.pool)
                    .insert(entry.id, &message, self.config.retry.max_retries as i32)
                    .await?;
                self.metrics.dlq_entries.inc();
                stats.failed += 1;
            }
        }

        self.metrics.batch_duration_seconds.observe(start.elapsed().as_secs_f64());
        tracing::info!(
            batch_id = %batch_id,
            successful = stats.successful,
            failed = stats.failed,
            retried = stats.retried,
            "batch completed"
        );
        Ok(stats)
    }

    /// Runs batches back-to-back while work is available, sleeping
    /// `loop_sleep_secs` between polls once the queue drains.
    pub async fn run_forever(&self) {
        tracing::info!("marker worker started");
        while !self.shutdown.is_set() {
            match self.mark_batch_with_retry().await {
                Ok(stats) if stats.total_processed() == 0 => {
                    let sleep = tokio::time::sleep(Duration::from_secs(self.config.loop_sleep_secs));
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.shutdown.wait() => {}
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "marker batch failed");
                    tokio::time::sleep(Duration::from_secs(self.config.loop_sleep_secs)).await;
                }
            }
        }
        tracing::info!("marker worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_error_matches_known_keywords() {
        assert!(is_retryable_error("Connection reset by peer"));
        assert!(is_retryable_error("deadlock detected"));
        assert!(is_retryable_error("statement timeout"));
        assert!(!is_retryable_error("duplicate key value violates unique constraint"));
    }

    #[test]
    fn batch_stats_total_processed_excludes_skipped_and_retried() {
        let stats = BatchStats { successful: 3, failed: 1, retried: 2, skipped: 0, batch_id: "x".into() };
        assert_eq!(stats.total_processed(), 4);
    }
}
