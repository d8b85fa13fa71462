//! Per-shard pending-file provider, grounded on
//! `des/packer/multi_shard_packer.py::SourceFileProvider` /
//! `PendingFile` and `des/packer/source_provider.py::MultiSourceFileProvider`.
//!
//! Claiming is two-phase: the marker (`des-marker`) assigns a DES name, hash,
//! and shard id to each `des_source_catalog` row ahead of time, so by the
//! time the packer claims a row it already knows which shard to route it to.
//! This provider wraps that claim step and fetches the row's payload bytes
//! from wherever the upstream business system actually stored them.

use aws_sdk_s3::Client;
use des_db::{CatalogEntry, SourceCatalogTable};
use des_error::{make_err, Code, Error};
use sqlx::PgPool;

/// A claimed row with its payload materialised, ready to append to a container.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub catalog_id: i64,
    pub name: String,
    pub data: Vec<u8>,
    pub meta: serde_json::Value,
}

pub struct SourceProvider {
    pool: PgPool,
    s3: Client,
}

impl SourceProvider {
    pub fn new(pool: PgPool, s3: Client) -> Self {
        SourceProvider { pool, s3 }
    }

    /// Claims up to `limit` marked rows for `shard_id` and downloads each
    /// one's bytes from its recorded source bucket/key. A row whose download
    /// fails is released back to `marked` rather than dropped, so it is
    /// retried on a later pass.
    pub async fn get_pending_files(&self, shard_id: u32, limit: u32) -> Result<Vec<PendingFile>, Error> {
        let table = SourceCatalogTable::new(&self.pool);
        let entries = table.claim_for_shard(shard_id, &self.holder_tag(), limit as i64).await?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.fetch_payload(&entry).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    tracing::warn!(catalog_id = entry.id, error = %e, "releasing claim after download failure");
                    let _ = table.release_claim(entry.id, &e.to_string()).await;
                }
            }
        }
        Ok(files)
    }

    fn holder_tag(&self) -> String {
        format!("{}-{}", hostname(), std::process::id())
    }

    async fn fetch_payload(&self, entry: &CatalogEntry) -> Result<PendingFile, Error> {
        let name = entry
            .des_name
            .clone()
            .ok_or_else(|| make_err!(Code::Internal, "claimed catalog row {} has no des_name", entry.id))?;
        let bucket = entry
            .source_bucket
            .as_deref()
            .ok_or_else(|| make_err!(Code::Internal, "catalog row {} missing source_bucket", entry.id))?;
        let key = entry
            .source_key
            .as_deref()
            .ok_or_else(|| make_err!(Code::Internal, "catalog row {} missing source_key", entry.id))?;

        let resp = self
            .s3
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "GET {bucket}/{key}: {e}"))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "reading body for {bucket}/{key}: {e}"))?
            .into_bytes()
            .to_vec();

        let meta = serde_json::json!({
            "source_bucket": bucket,
            "source_key": key,
            "des_hash": entry.des_hash,
        });

        Ok(PendingFile {
            catalog_id: entry.id,
            name,
            data,
            meta,
        })
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "des-packer".to_string())
}
