//! Dead-letter queue (spec §3.8), grounded on
//! `des/marker/advanced_marker.py::_send_to_dlq`.

use chrono::Utc;
use des_error::{make_err, Code, Error};
use sqlx::postgres::PgPool;

pub struct DeadLetterQueue<'a> {
    pool: &'a PgPool,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        DeadLetterQueue { pool }
    }

    pub async fn insert(&self, catalog_entry_id: i64, error_message: &str, retry_count: i32) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO des_dead_letters (catalog_entry_id, created_at, error_message, retry_count) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(catalog_entry_id)
        .bind(Utc::now())
        .bind(error_message)
        .bind(retry_count)
        .execute(self.pool)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "writing dead-letter entry for catalog row {catalog_entry_id}: {e}"))?;
        Ok(())
    }
}
