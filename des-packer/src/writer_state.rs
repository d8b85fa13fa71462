//! Per-shard open-container state, grounded on
//! `des/packer/multi_shard_packer.py::_ensure_writer` / `_finalize_writer` /
//! `_maybe_checkpoint`.

use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use des_db::ContainerCatalog;
use des_error::{make_err, Code, Error, ResultExt};
use des_format::{ExternalConfig, Writer};
use sqlx::PgPool;

fn dest_key(dest_prefix: &str, shard_id: u32, shard_hex_width: usize, day: NaiveDate) -> String {
    let shard_hex = format!("{:0width$x}", shard_id, width = shard_hex_width);
    let key = format!("{}/shard_{}.des", day.format("%Y-%m-%d"), shard_hex);
    let prefix = dest_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        key
    } else {
        format!("{prefix}/{key}")
    }
}

/// An open local container file for one shard's current day, along with the
/// catalog row tracking it and enough bookkeeping to decide when to
/// checkpoint or roll over.
pub struct WriterState {
    pub day: NaiveDate,
    pub container_id: i64,
    pub local_path: PathBuf,
    pub dest_key: String,
    writer: Writer<File>,
    pub file_count: u64,
    pub data_bytes: u64,
    last_checkpoint: Instant,
    /// Catalog ids appended since the writer was opened, marked `packed` only
    /// once the container they ended up in is actually uploaded.
    pending_catalog_ids: Vec<i64>,
}

impl WriterState {
    pub async fn open(
        pool: &PgPool,
        work_dir: &std::path::Path,
        dest_prefix: &str,
        shard_id: u32,
        shard_hex_width: usize,
        day: NaiveDate,
        big_file_threshold: u64,
        external: Option<ExternalConfig>,
    ) -> Result<Self, Error> {
        let day_dir = work_dir.join(day.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&day_dir)
            .map_err(|e| make_err!(Code::Internal, "creating {}: {e}", day_dir.display()))?;
        let shard_hex = format!("{:0width$x}", shard_id, width = shard_hex_width);
        let local_path = day_dir.join(format!("shard_{shard_hex}.des"));

        let file = File::create(&local_path)
            .map_err(|e| make_err!(Code::Internal, "creating {}: {e}", local_path.display()))?;
        let writer = Writer::new(file, big_file_threshold, external).err_tip(|| "opening container writer")?;

        let key = dest_key(dest_prefix, shard_id, shard_hex_width, day);
        let container_id = ContainerCatalog::new(pool).create_writing(shard_id, day, &key).await?;

        Ok(WriterState {
            day,
            container_id,
            local_path,
            dest_key: key,
            writer,
            file_count: 0,
            data_bytes: 0,
            last_checkpoint: Instant::now(),
            pending_catalog_ids: Vec::new(),
        })
    }

    pub fn add(&mut self, catalog_id: i64, name: &str, data: &[u8], meta: serde_json::Value) -> Result<(), Error> {
        self.writer.add(name, data, meta)?;
        self.file_count += 1;
        self.data_bytes += data.len() as u64;
        self.pending_catalog_ids.push(catalog_id);
        Ok(())
    }

    pub fn should_checkpoint(&self, every_files: u64, every_seconds: u64) -> bool {
        (every_files > 0 && self.file_count % every_files == 0)
            || self.last_checkpoint.elapsed().as_secs() >= every_seconds
    }

    pub async fn checkpoint(&mut self, pool: &PgPool) -> Result<(), Error> {
        ContainerCatalog::new(pool)
            .checkpoint(self.container_id, self.file_count as i32, self.data_bytes as i64)
            .await?;
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    /// Closes the container, returning externalised side-objects so the
    /// caller can confirm they were already uploaded, the final counts, and
    /// the catalog ids appended — the caller marks these `packed` only after
    /// the container itself is durably uploaded.
    pub fn close(self) -> Result<(Vec<des_format::ExternalObjectInfo>, u64, u64, Vec<i64>), Error> {
        let file_count = self.file_count;
        let data_bytes = self.data_bytes;
        let pending_catalog_ids = self.pending_catalog_ids;
        let externalised = self.writer.close()?;
        Ok((externalised, file_count, data_bytes, pending_catalog_ids))
    }
}
