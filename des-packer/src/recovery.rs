//! Crash-recovery sweeps, grounded on `des/packer/recovery.py::CrashRecoveryManager`.
//!
//! Run periodically (not on every packer pass) from a separate task so a
//! single slow sweep never blocks per-shard packing.

use std::collections::HashSet;

use aws_sdk_s3::Client;
use chrono::Utc;
use des_config::RecoveryConfig;
use des_db::{ContainerCatalog, ShardLockTable, SourceCatalogTable};
use des_error::{make_err, Code, Error};
use des_store::{Reader, S3Backend};
use sqlx::PgPool;

use crate::metrics::{PackerMetrics, RecoveryActionLabel};

pub struct RecoveryManager {
    pool: PgPool,
    s3: Client,
    dest_bucket: String,
    dest_prefix: String,
    config: RecoveryConfig,
    metrics: std::sync::Arc<PackerMetrics>,
}

impl RecoveryManager {
    pub fn new(
        pool: PgPool,
        s3: Client,
        dest_bucket: String,
        dest_prefix: String,
        config: RecoveryConfig,
        metrics: std::sync::Arc<PackerMetrics>,
    ) -> Self {
        RecoveryManager { pool, s3, dest_bucket, dest_prefix, config, metrics }
    }

    /// Unclaims `des_source_catalog` rows whose claim is older than
    /// `claim_timeout_secs` with no heartbeat-driven progress.
    pub async fn recover_stale_claims(&self) -> Result<u64, Error> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.claim_timeout_secs as i64);
        let released = SourceCatalogTable::new(&self.pool).release_stale_claims(cutoff).await?;
        self.metrics.recovery_stale_claims.inc_by(released);
        if released > 0 {
            tracing::info!(released, "recovered stale source-file claims");
        }
        Ok(released)
    }

    /// `true` if the object is present, `false` if it is absent (missing
    /// key), and an error for any other HEAD failure (network, permissions).
    async fn object_exists(&self, key: &str) -> Result<bool, Error> {
        match self.s3.head_object().bucket(self.dest_bucket.as_str()).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("NotFound") || msg.contains("404") {
                    Ok(false)
                } else {
                    Err(make_err!(Code::Unavailable, "HEAD {}/{key}: {e}", self.dest_bucket))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), Error> {
        self.s3
            .delete_object()
            .bucket(self.dest_bucket.as_str())
            .key(key)
            .send()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "deleting {}/{key}: {e}", self.dest_bucket))?;
        Ok(())
    }

    /// Finalizes or fails containers stuck in `writing` past the grace
    /// period. An absent object is marked `failed` outright; a present but
    /// footer-invalid object is deleted first, then marked `failed`, so a
    /// corrupt partial upload never lingers as an orphan (spec §4.I(2)).
    pub async fn cleanup_partial_containers(&self) -> Result<u32, Error> {
        let catalog = ContainerCatalog::new(&self.pool);
        let stale = catalog.stale_writing(self.config.container_grace_secs as i64).await?;
        let mut actions = 0u32;

        for container in stale {
            if !self.object_exists(&container.s3_key).await? {
                catalog.mark_failed(container.id).await?;
                actions += 1;
                self.record_partial("missing_mark_failed");
                tracing::warn!(container_id = container.id, key = %container.s3_key, "container missing from object store");
                continue;
            }

            let backend = S3Backend::new(self.s3.clone(), self.dest_bucket.clone(), container.s3_key.clone());
            let reader = Reader::open(backend).await?;
            match reader.stats().await {
                Err(e) => {
                    if let Err(delete_err) = self.delete_object(&container.s3_key).await {
                        tracing::error!(container_id = container.id, key = %container.s3_key, error = %delete_err, "failed to delete corrupt container object");
                    }
                    catalog.mark_failed(container.id).await?;
                    actions += 1;
                    self.record_partial("corrupt_object_deleted_mark_failed");
                    tracing::warn!(container_id = container.id, key = %container.s3_key, error = %e, "container object present but invalid footer, deleted");
                }
                Ok(stats) => {
                    catalog
                        .finalize(container.id, stats.total_files as i32, container.data_bytes)
                        .await?;
                    actions += 1;
                    self.record_partial("finalized");
                    tracing::info!(container_id = container.id, key = %container.s3_key, "container finalized after recovery");
                }
            }
        }
        Ok(actions)
    }

    pub async fn release_expired_locks(&self) -> Result<u32, Error> {
        let locks = ShardLockTable::new(&self.pool).expired_locks().await?;
        let table = ShardLockTable::new(&self.pool);
        for (shard_id, holder) in &locks {
            table.release(*shard_id, holder).await?;
        }
        self.metrics.recovery_expired_locks.inc_by(locks.len() as u64);
        Ok(locks.len() as u32)
    }

    /// Validates every `des_containers` row against the object store and
    /// deletes any object under the destination prefix with no DB row.
    pub async fn verify_container_integrity(&self) -> Result<u32, Error> {
        let catalog = ContainerCatalog::new(&self.pool);
        let containers = catalog.list_all().await?;
        let mut known_keys: HashSet<String> = HashSet::new();
        let mut actions = 0u32;

        for container in &containers {
            known_keys.insert(container.s3_key.clone());

            if !self.object_exists(&container.s3_key).await? {
                catalog.mark_failed(container.id).await?;
                actions += 1;
                self.record("missing_in_object_store_mark_failed");
                continue;
            }

            let backend = S3Backend::new(self.s3.clone(), self.dest_bucket.clone(), container.s3_key.clone());
            let reader = Reader::open(backend).await?;
            match reader.stats().await {
                Err(_) => {
                    catalog.mark_failed(container.id).await?;
                    actions += 1;
                    self.record("invalid_footer_mark_failed");
                }
                Ok(stats) => {
                    if stats.total_files as i32 != container.file_count {
                        catalog.checkpoint(container.id, stats.total_files as i32, container.data_bytes).await?;
                        actions += 1;
                        self.record("file_count_corrected");
                    }
                }
            }
        }

        if self.config.cleanup_orphaned_objects {
            let orphaned = self.find_orphaned_objects(&known_keys).await?;
            for key in orphaned {
                if self
                    .s3
                    .delete_object()
                    .bucket(self.dest_bucket.as_str())
                    .key(key.as_str())
                    .send()
                    .await
                    .is_ok()
                {
                    actions += 1;
                    self.record("orphan_object_deleted");
                    tracing::warn!(key = %key, "deleted orphaned object with no catalog row");
                }
            }
        }

        Ok(actions)
    }

    async fn find_orphaned_objects(&self, known_keys: &HashSet<String>) -> Result<Vec<String>, Error> {
        let mut orphaned = Vec::new();
        let mut continuation: Option<String> = None
            ;
        loop {
            let mut req = self.s3.list_objects_v2().bucket(self.dest_bucket.as_str());
            if !self.dest_prefix.is_empty() {
                req = req.prefix(format!("{}/", self.dest_prefix.trim_end_matches('/')));
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token.as_str());
            }
            let resp = req.send().await.map_err(|e| {
                des_error::make_err!(des_error::Code::Unavailable, "listing {}: {e}", self.dest_bucket)
            })?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    if key.ends_with(".des") && !known_keys.contains(key) {
                        orphaned.push(key.to_string());
                    }
                }
            }
            continuation = resp.next_continuation_token().map(|s| s.to_string());
            if continuation.is_none() {
                break;
            }
        }
        Ok(orphaned)
    }

    fn record(&self, action: &str) {
        self.metrics
            .recovery_container_integrity
            .get_or_create(&RecoveryActionLabel { action: action.to_string() })
            .inc();
    }

    fn record_partial(&self, action: &str) {
        self.metrics
            .recovery_partial_containers
            .get_or_create(&RecoveryActionLabel { action: action.to_string() })
            .inc();
    }

    /// Runs all four sweeps once, logging a summary.
    pub async fn run_once(&self) -> Result<(), Error> {
        let stale_claims = self.recover_stale_claims().await?;
        let partial = self.cleanup_partial_containers().await?;
        let locks = self.release_expired_locks().await?;
        let integrity = self.verify_container_integrity().await?;
        tracing::info!(stale_claims, partial, locks, integrity, "recovery sweep completed");
        Ok(())
    }
}
