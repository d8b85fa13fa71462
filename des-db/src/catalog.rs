//! Container catalog (spec §3.6), grounded on `des/db/connector.py::DesContainer`.

use chrono::{DateTime, NaiveDate, Utc};
use des_error::{make_err, Code, Error};
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: i64,
    pub shard_id: u32,
    pub day: NaiveDate,
    pub status: String,
    pub s3_key: String,
    pub file_count: i32,
    pub data_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

pub struct ContainerCatalog<'a> {
    pool: &'a PgPool,
}

impl<'a> ContainerCatalog<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        ContainerCatalog { pool }
    }

    /// Creates the "writing" row for a freshly opened container, returning its id.
    pub async fn create_writing(&self, shard_id: u32, day: NaiveDate, s3_key: &str) -> Result<i64, Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO des_containers (shard_id, day, status, s3_key, file_count, data_bytes, created_at)
            VALUES ($1, $2, 'writing', $3, 0, 0, $4)
            RETURNING id
            "#,
        )
        .bind(shard_id as i32)
        .bind(day)
        .bind(s3_key)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "creating container row for shard {shard_id}: {e}"))?;
        Ok(row.get::<i64, _>("id"))
    }

    pub async fn checkpoint(&self, id: i64, file_count: i32, data_bytes: i64) -> Result<(), Error> {
        sqlx::query("UPDATE des_containers SET file_count = $2, data_bytes = $3 WHERE id = $1")
            .bind(id)
            .bind(file_count)
            .bind(data_bytes)
            .execute(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "checkpointing container {id}: {e}"))?;
        Ok(())
    }

    pub async fn finalize(&self, id: i64, file_count: i32, data_bytes: i64) -> Result<(), Error> {
        sqlx::query(
            "UPDATE des_containers SET status = 'finalized', file_count = $2, data_bytes = $3, finalized_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(file_count)
        .bind(data_bytes)
        .bind(Utc::now())
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "finalizing container {id}: {e}"))?;
        Ok(())
    }

    /// Containers still `status = 'writing'` older than `grace_secs`, for the
    /// partial-container recovery sweep (spec §4.K).
    pub async fn stale_writing(&self, grace_secs: i64) -> Result<Vec<ContainerRecord>, Error> {
        let cutoff = Utc::now() - chrono::Duration::seconds(grace_secs);
        let rows = sqlx::query(
            "SELECT id, shard_id, day, status, s3_key, file_count, data_bytes, created_at, finalized_at \
             FROM des_containers WHERE status = 'writing' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "listing stale containers: {e}"))?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE des_containers SET status = 'failed', finalized_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "marking container {id} failed: {e}"))?;
        Ok(())
    }

    /// All containers, for the integrity sweep's orphan-detection pass
    /// (spec §4.K): every object under the destination prefix not named here
    /// has no corresponding metadata row.
    pub async fn list_all(&self) -> Result<Vec<ContainerRecord>, Error> {
        let rows = sqlx::query(
            "SELECT id, shard_id, day, status, s3_key, file_count, data_bytes, created_at, finalized_at \
             FROM des_containers",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "listing containers: {e}"))?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    pub async fn latest_for_shard_day(&self, shard_id: u32, day: NaiveDate) -> Result<Option<ContainerRecord>, Error> {
        let row = sqlx::query(
            "SELECT id, shard_id, day, status, s3_key, file_count, data_bytes, created_at, finalized_at \
             FROM des_containers WHERE shard_id = $1 AND day = $2 ORDER BY id DESC LIMIT 1",
        )
        .bind(shard_id as i32)
        .bind(day)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "looking up container for shard {shard_id}: {e}"))?;
        Ok(row.map(row_to_record))
    }
}

fn row_to_record(row: sqlx::postgres::PgRow) -> ContainerRecord {
    ContainerRecord {
        id: row.get("id"),
        shard_id: row.get::<i32, _>("shard_id") as u32,
        day: row.get("day"),
        status: row.get("status"),
        s3_key: row.get("s3_key"),
        file_count: row.get("file_count"),
        data_bytes: row.get("data_bytes"),
        created_at: row.get("created_at"),
        finalized_at: row.get("finalized_at"),
    }
}
