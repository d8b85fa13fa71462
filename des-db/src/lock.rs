//! Distributed shard-lock table (spec §4.F/§5), grounded on
//! `des/db/connector.py::try_acquire_shard_lock` / `renew_shard_lock` /
//! `release_shard_lock`.
//!
//! Acquisition is a single atomic UPSERT guarded by `expires_at < now OR
//! holder_id = holder`, so a dead holder's expired lock or the current
//! holder's own lock can always be taken/renewed, but a live competitor's
//! lock cannot.

use chrono::{DateTime, Utc};
use des_error::{make_err, Code, Error};
use sqlx::postgres::PgPool;

pub struct ShardLockTable<'a> {
    pool: &'a PgPool,
}

impl<'a> ShardLockTable<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        ShardLockTable { pool }
    }

    pub async fn try_acquire(&self, shard_id: u32, holder_id: &str, ttl_secs: i64) -> Result<bool, Error> {
        let now: DateTime<Utc> = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);

        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO des_shard_locks (shard_id, holder_id, acquired_at, heartbeat_at, expires_at, state)
            VALUES ($1, $2, $3, $3, $4, 'held')
            ON CONFLICT (shard_id) DO UPDATE SET
                holder_id = $2,
                acquired_at = $3,
                heartbeat_at = $3,
                expires_at = $4,
                state = 'held'
            WHERE des_shard_locks.expires_at < $3 OR des_shard_locks.holder_id = $2
            RETURNING shard_id
            "#,
        )
        .bind(shard_id as i32)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "acquiring lock for shard {shard_id}: {e}"))?;

        Ok(row.is_some())
    }

    pub async fn renew(&self, shard_id: u32, holder_id: &str, ttl_secs: i64) -> Result<bool, Error> {
        let now: DateTime<Utc> = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);

        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE des_shard_locks
            SET heartbeat_at = $3, expires_at = $4, state = 'held'
            WHERE shard_id = $1 AND holder_id = $2 AND expires_at > $3
            RETURNING shard_id
            "#,
        )
        .bind(shard_id as i32)
        .bind(holder_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "renewing lock for shard {shard_id}: {e}"))?;

        Ok(row.is_some())
    }

    /// Best-effort: a failure to delete does not prevent shutdown, since the
    /// lock will simply expire on its own.
    pub async fn release(&self, shard_id: u32, holder_id: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM des_shard_locks WHERE shard_id = $1 AND holder_id = $2")
            .bind(shard_id as i32)
            .bind(holder_id)
            .execute(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "releasing lock for shard {shard_id}: {e}"))?;
        Ok(())
    }

    /// Locks with `expires_at` in the past, for the recovery sweep (spec §4.K).
    pub async fn expired_locks(&self) -> Result<Vec<(u32, String)>, Error> {
        let rows: Vec<(i32, String)> = sqlx::query_as(
            "SELECT shard_id, holder_id FROM des_shard_locks WHERE expires_at < $1",
        )
        .bind(Utc::now())
        .fetch_all(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "listing expired locks: {e}"))?;
        Ok(rows.into_iter().map(|(id, holder)| (id as u32, holder)).collect())
    }
}
