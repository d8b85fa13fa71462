//! Top-level orchestration: one `ShardWorker` task per owned shard plus a
//! periodic recovery sweep, grounded on
//! `des/packer/multi_shard_packer.py::MultiShardPacker.run_forever`.
//!
//! Unlike the original's single-threaded round-robin over `shard_ids`, shards
//! run as independent tasks here so one shard's upload never stalls another's
//! claim-and-append loop; each still holds exactly one lease at a time, so
//! correctness is unaffected by the concurrency.

use std::sync::Arc;

use aws_sdk_s3::Client;
use des_config::DesConfig;
use des_error::{make_err, Code, Error};
use sqlx::PgPool;

use crate::metrics::PackerMetrics;
use crate::recovery::RecoveryManager;
use crate::shard_worker::ShardWorker;
use crate::shutdown::Shutdown;

pub struct Packer {
    pool: PgPool,
    s3: Client,
    config: DesConfig,
    metrics: Arc<PackerMetrics>,
    pub shutdown: Arc<Shutdown>,
}

impl Packer {
    pub fn new(pool: PgPool, s3: Client, config: DesConfig, metrics: Arc<PackerMetrics>) -> Self {
        Packer { pool, s3, config, metrics, shutdown: Arc::new(Shutdown::new()) }
    }

    pub async fn run_forever(self) -> Result<(), Error> {
        let packer_config = self
            .config
            .packer
            .clone()
            .ok_or_else(|| make_err!(Code::FailedPrecondition, "packer section missing from configuration"))?;

        let holder_id: Arc<str> = Arc::from(format!(
            "{}-{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "des-packer".to_string()),
            std::process::id()
        ));

        let mut handles = Vec::new();
        for shard_id in packer_config.shard_ids.clone() {
            let worker = ShardWorker::new(
                self.pool.clone(),
                self.s3.clone(),
                shard_id,
                self.config.node.shard_bits,
                holder_id.clone(),
                packer_config.clone(),
                self.config.writer.clone(),
                packer_config.dest_bucket.clone(),
                self.metrics.clone(),
                self.shutdown.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        let recovery = Arc::new(RecoveryManager::new(
            self.pool.clone(),
            self.s3.clone(),
            packer_config.dest_bucket.clone(),
            packer_config.dest_prefix.clone(),
            self.config.recovery.clone(),
            self.metrics.clone(),
        ));
        let recovery_shutdown = self.shutdown.clone();
        let recovery_interval = packer_config.checkpoint_every_seconds.max(60) * 5;
        handles.push(tokio::spawn(async move {
            while !recovery_shutdown.is_set() {
                if let Err(e) = recovery.run_once().await {
                    tracing::error!(error = %e, "recovery sweep failed");
                }
                let sleep = tokio::time::sleep(std::time::Duration::from_secs(recovery_interval));
                tokio::select! {
                    _ = sleep => {}
                    _ = recovery_shutdown.wait() => {}
                }
            }
        }));

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
