//! Marker-worker catalog table (spec §4.G), grounded on
//! `des/db/catalog.py::CatalogEntry` and `des/marker/advanced_marker.py`.

use chrono::{DateTime, Utc};
use des_error::{make_err, Code, Error};
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub des_name: Option<String>,
    pub des_hash: Option<String>,
    pub des_shard: Option<i32>,
    pub des_status: Option<String>,
    pub des_container_id: Option<i64>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub source_bucket: Option<String>,
    pub source_key: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

pub struct SourceCatalogTable<'a> {
    pool: &'a PgPool,
}

impl<'a> SourceCatalogTable<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        SourceCatalogTable { pool }
    }

    /// Claims up to `limit` rows awaiting marking. `SKIP LOCKED` lets
    /// multiple marker workers run against the same table without stepping
    /// on each other's batches.
    pub async fn select_candidates(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<CatalogEntry>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, des_name, des_hash, des_shard, des_status, retry_count, last_error,
                   source_bucket, source_key
            FROM des_source_catalog
            WHERE created_at <= $1
              AND (des_status IS NULL OR des_status = 'retry' OR des_name IS NULL)
            ORDER BY id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "selecting marker candidates: {e}"))?;
        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    pub async fn mark_success(&self, id: i64, des_name: &str, des_hash: &str, des_shard: i32) -> Result<(), Error> {
        sqlx::query(
            "UPDATE des_source_catalog SET des_name = $2, des_hash = $3, des_shard = $4, \
             des_status = 'marked', retry_count = 0, last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(des_name)
        .bind(des_hash)
        .bind(des_shard)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "marking catalog entry {id} succeeded: {e}"))?;
        Ok(())
    }

    pub async fn mark_retry(&self, id: i64, error: &str) -> Result<(), Error> {
        let truncated = &error[..error.len().min(500)];
        sqlx::query(
            "UPDATE des_source_catalog SET des_status = 'retry', retry_count = retry_count + 1, \
             last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(truncated)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "marking catalog entry {id} for retry: {e}"))?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<(), Error> {
        let truncated = &error[..error.len().min(500)];
        sqlx::query(
            "UPDATE des_source_catalog SET des_status = 'failed', retry_count = retry_count + 1, \
             last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(truncated)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "marking catalog entry {id} failed: {e}"))?;
        Ok(())
    }

    /// Claims up to `limit` rows already marked (named, hashed, and assigned
    /// to `shard_id` by the marker) for packing. `SKIP LOCKED` lets multiple
    /// packer processes own disjoint shards against the same table without
    /// contending on rows outside their lease.
    pub async fn claim_for_shard(
        &self,
        shard_id: u32,
        holder_id: &str,
        limit: i64,
    ) -> Result<Vec<CatalogEntry>, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "starting claim transaction for shard {shard_id}: {e}"))?;

        let rows = sqlx::query(
            r#"
            SELECT id, created_at, des_name, des_hash, des_shard, des_status, des_container_id,
                   retry_count, last_error, source_bucket, source_key, claimed_by, claimed_at
            FROM des_source_catalog
            WHERE des_shard = $1 AND des_status = 'marked'
            ORDER BY id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(shard_id as i32)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "selecting claimable files for shard {shard_id}: {e}"))?;

        let entries: Vec<CatalogEntry> = rows.into_iter().map(row_to_entry).collect();
        if !entries.is_empty() {
            let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
            sqlx::query(
                "UPDATE des_source_catalog SET des_status = 'claimed', claimed_by = $2, claimed_at = $3 \
                 WHERE id = ANY($1)",
            )
            .bind(&ids)
            .bind(holder_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "claiming files for shard {shard_id}: {e}"))?;
        }

        tx.commit()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "committing claim for shard {shard_id}: {e}"))?;
        Ok(entries)
    }

    /// Marks a claimed row as packed into `container_id`.
    pub async fn mark_packed(&self, id: i64, container_id: i64) -> Result<(), Error> {
        sqlx::query(
            "UPDATE des_source_catalog SET des_status = 'packed', des_container_id = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(container_id)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "marking catalog entry {id} packed: {e}"))?;
        Ok(())
    }

    /// Releases a claim back to `marked` so another packer pass can retry it,
    /// used when appending to the container fails after claiming.
    pub async fn release_claim(&self, id: i64, error: &str) -> Result<(), Error> {
        let truncated = &error[..error.len().min(500)];
        sqlx::query(
            "UPDATE des_source_catalog SET des_status = 'marked', claimed_by = NULL, claimed_at = NULL, \
             retry_count = retry_count + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(truncated)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "releasing claim on catalog entry {id}: {e}"))?;
        Ok(())
    }

    /// Resets claims held past `cutoff` back to `marked`, for the packer's
    /// stale-claim recovery sweep (spec §4.K), mirroring
    /// `CrashRecoveryManager.recover_stale_claims`.
    pub async fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE des_source_catalog SET des_status = 'marked', claimed_by = NULL, claimed_at = NULL \
             WHERE des_status = 'claimed' AND (claimed_at IS NULL OR claimed_at < $1)",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "releasing stale claims: {e}"))?;
        Ok(result.rows_affected())
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> CatalogEntry {
    CatalogEntry {
        id: row.get("id"),
        created_at: row.get("created_at"),
        des_name: row.get("des_name"),
        des_hash: row.get("des_hash"),
        des_shard: row.get("des_shard"),
        des_status: row.get("des_status"),
        des_container_id: row.get("des_container_id"),
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        source_bucket: row.get("source_bucket"),
        source_key: row.get("source_key"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
    }
}
