//! Single-shard packing loop, grounded on
//! `des/packer/multi_shard_packer.py::MultiShardPacker._process_shard`.
//!
//! One `ShardWorker` owns exactly one shard's lease and its current-day
//! container; a process runs one per entry in `PackerConfig::shard_ids`.

use std::sync::Arc;
use std::time::Instant;

use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use des_assign::shard_hex_width;
use des_config::{PackerConfig, WriterConfig};
use des_db::ShardLockTable;
use des_error::{make_err, Code, Error};
use des_format::ExternalConfig;
use des_store::{retry_with_backoff, RetryPolicy, S3ExternalSink};
use sqlx::PgPool;
use std::time::Duration;

use crate::heartbeat::HeartbeatManager;
use crate::metrics::{PackerMetrics, ShardLabel};
use crate::shutdown::Shutdown;
use crate::source_provider::SourceProvider;
use crate::writer_state::WriterState;

pub struct ShardWorker {
    pool: PgPool,
    s3: Client,
    shard_id: u32,
    shard_hex_width: usize,
    holder_id: Arc<str>,
    config: PackerConfig,
    writer_config: WriterConfig,
    dest_bucket: String,
    source: SourceProvider,
    metrics: Arc<PackerMetrics>,
    shutdown: Arc<Shutdown>,
    heartbeat: Option<HeartbeatManager>,
    state: Option<WriterState>,
}

impl ShardWorker {
    pub fn new(
        pool: PgPool,
        s3: Client,
        shard_id: u32,
        shard_bits: u8,
        holder_id: Arc<str>,
        config: PackerConfig,
        writer_config: WriterConfig,
        dest_bucket: String,
        metrics: Arc<PackerMetrics>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        let source = SourceProvider::new(pool.clone(), s3.clone());
        ShardWorker {
            pool,
            s3,
            shard_id,
            shard_hex_width: shard_hex_width(shard_bits),
            holder_id,
            config,
            writer_config,
            dest_bucket,
            source,
            metrics,
            shutdown,
            heartbeat: None,
            state: None,
        }
    }

    fn label(&self) -> ShardLabel {
        ShardLabel { shard_id: self.shard_id.to_string() }
    }

    fn external_config(&self) -> Option<ExternalConfig> {
        let prefix = self.writer_config.external_prefix.clone()?;
        let bucket = self.writer_config.external_bucket.clone()?;
        let sink = S3ExternalSink::new(self.s3.clone(), bucket, tokio::runtime::Handle::current());
        Some(ExternalConfig { sink: Box::new(sink), external_prefix: prefix })
    }

    async fn ensure_writer(&mut self) -> Result<(), Error> {
        let today = Utc::now().date_naive();
        if let Some(state) = &self.state {
            if state.day != today {
                self.finalize_writer().await?;
            }
        }
        if self.state.is_none() {
            let external = self.external_config();
            let state = WriterState::open(
                &self.pool,
                &self.config.work_dir,
                &self.config.dest_prefix,
                self.shard_id,
                self.shard_hex_width,
                today,
                self.writer_config.big_file_threshold,
                external,
            )
            .await?;
            self.state = Some(state);
        }
        Ok(())
    }

    async fn finalize_writer(&mut self) -> Result<(), Error> {
        let Some(state) = self.state.take() else { return Ok(()) };
        let local_path = state.local_path.clone();
        let dest_key = state.dest_key.clone();
        let container_id = state.container_id;
        let (_externalised, file_count, data_bytes, pending_catalog_ids) = state.close()?;

        let bytes = tokio::fs::read(&local_path)
            .await
            .map_err(|e| make_err!(Code::Internal, "reading {}: {e}", local_path.display()))?;
        let bytes = bytes::Bytes::from(bytes);

        // Upload is retried under transient S3 errors; on exhaustion the
        // container row stays `writing` and the recovery manager handles it.
        // The source rows stay `packed`-pending too, since marking happens
        // only after a confirmed upload below.
        let upload_retry = RetryPolicy {
            max_retries: self.config.upload_retry.max_retries,
            base_delay: Duration::from_millis(self.config.upload_retry.base_delay_ms),
            backoff_base: self.config.upload_retry.backoff_base,
            jitter_ratio: self.config.upload_retry.jitter_ratio,
        };
        retry_with_backoff(&upload_retry, Error::is_transient, || async {
            self.s3
                .put_object()
                .bucket(self.dest_bucket.as_str())
                .key(dest_key.as_str())
                .body(ByteStream::from(bytes.clone()))
                .send()
                .await
                .map_err(|e| make_err!(Code::Unavailable, "uploading {}/{dest_key}: {e}", self.dest_bucket))
        })
        .await?;

        des_db::ContainerCatalog::new(&self.pool)
            .finalize(container_id, file_count as i32, data_bytes as i64)
            .await?;

        let catalog = des_db::SourceCatalogTable::new(&self.pool);
        for catalog_id in pending_catalog_ids {
            catalog.mark_packed(catalog_id, container_id).await?;
        }

        tracing::info!(shard_id = self.shard_id, container_id, file_count, "container finalized and uploaded");
        Ok(())
    }

    /// One lock-acquire-claim-append-checkpoint pass. Returns the number of
    /// files appended, for the caller to decide whether to keep looping
    /// without sleeping.
    async fn process_once(&mut self) -> Result<usize, Error> {
        let start = Instant::now();
        let label = self.label();

        let acquired = ShardLockTable::new(&self.pool)
            .try_acquire(self.shard_id, &self.holder_id, self.config.lock_ttl_secs as i64)
            .await?;
        if !acquired {
            self.metrics.shard_lock_conflicts.get_or_create(&label).inc();
            return Ok(0);
        }

        if self.heartbeat.is_none() {
            self.heartbeat = Some(HeartbeatManager::start(
                self.pool.clone(),
                self.shard_id,
                self.holder_id.clone(),
                self.config.lock_ttl_secs,
            ));
        }

        self.ensure_writer().await?;

        let files = self.source.get_pending_files(self.shard_id, self.config.batch_size).await?;
        if files.is_empty() {
            self.metrics.loop_duration_seconds.get_or_create(&label).set(start.elapsed().as_secs_f64());
            return Ok(0);
        }

        let catalog = des_db::SourceCatalogTable::new(&self.pool);
        let state = self.state.as_mut().expect("ensure_writer just populated this");
        let mut appended = 0usize;
        for file in &files {
            match state.add(file.catalog_id, &file.name, &file.data, file.meta.clone()) {
                Ok(()) => {
                    self.metrics.packed_files.get_or_create(&label).inc();
                    self.metrics.packed_bytes.get_or_create(&label).inc_by(file.data.len() as u64);
                    appended += 1;
                }
                Err(e) => {
                    tracing::error!(catalog_id = file.catalog_id, error = %e, "failed to append file to container");
                    catalog.release_claim(file.catalog_id, &e.to_string()).await?;
                }
            }
        }

        if state.should_checkpoint(self.config.checkpoint_every_files, self.config.checkpoint_every_seconds) {
            state.checkpoint(&self.pool).await?;
        }

        self.metrics.loop_duration_seconds.get_or_create(&label).set(start.elapsed().as_secs_f64());
        Ok(appended)
    }

    /// Runs until shutdown, sleeping `loop_sleep_secs` between empty passes
    /// and retrying immediately after a pass that did real work.
    pub async fn run(mut self) {
        while !self.shutdown.is_set() {
            match self.process_once().await {
                Ok(0) => {
                    let sleep = tokio::time::sleep(std::time::Duration::from_secs(self.config.loop_sleep_secs));
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.shutdown.wait() => {}
                    }
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(shard_id = self.shard_id, error = %e, "shard pass failed");
                    tokio::time::sleep(std::time::Duration::from_secs(self.config.loop_sleep_secs)).await;
                }
            }
        }
        if let Some(hb) = self.heartbeat.take() {
            hb.stop();
        }
        if let Err(e) = self.finalize_writer().await {
            tracing::error!(shard_id = self.shard_id, error = %e, "failed to finalize container during shutdown");
        }
        let _ = ShardLockTable::new(&self.pool).release(self.shard_id, &self.holder_id).await;
        tracing::info!(shard_id = self.shard_id, "shard worker stopped");
    }
}
