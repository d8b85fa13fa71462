//! Multi-source claim/mark connector (spec §3.9, §4.H), grounded on
//! `des/packer/source_provider.py::MultiSourceFileProvider` and
//! `des/db/source_connector.py`.
//!
//! Column and table names come from trusted operator configuration
//! (`des_config::SourceConfig`), not user input, but are still validated
//! against a conservative identifier pattern before being interpolated into
//! SQL, since `sqlx` has no bind-parameter form for identifiers.

use des_config::SourceConfig;
use des_error::{make_err, Code, Error};
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct PendingFile {
    pub id: i64,
    pub shard_id: Option<i64>,
    pub s3_bucket: String,
    pub s3_key: String,
    pub size_bytes: i64,
    pub metadata: Map<String, Value>,
}

fn validate_identifier(name: &str) -> Result<(), Error> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(make_err!(Code::InvalidArgument, "'{name}' is not a valid SQL identifier"))
    }
}

pub struct SourceConnector<'a> {
    pool: &'a PgPool,
    config: SourceConfig,
}

impl<'a> SourceConnector<'a> {
    pub fn new(pool: &'a PgPool, config: SourceConfig) -> Result<Self, Error> {
        validate_identifier(&config.table)?;
        validate_identifier(&config.id_column)?;
        validate_identifier(&config.status_column)?;
        validate_identifier(&config.claimed_by_column)?;
        validate_identifier(&config.claimed_at_column)?;
        validate_identifier(&config.s3_bucket_column)?;
        validate_identifier(&config.s3_key_column)?;
        validate_identifier(&config.size_column)?;
        for col in &config.metadata_columns {
            validate_identifier(col)?;
        }
        Ok(SourceConnector { pool, config })
    }

    /// Cheap connectivity probe for this source, used by the health checker.
    pub async fn ping(&self) -> Result<(), Error> {
        let sql = format!("SELECT 1 FROM {} LIMIT 1", self.config.table);
        sqlx::query(&sql)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "pinging {}: {e}", self.config.table))?;
        Ok(())
    }

    /// Claims up to `limit` pending rows: a `SKIP LOCKED` select followed by
    /// an `UPDATE ... WHERE id = ANY($1)` that stamps them as claimed by
    /// `holder_id`.
    pub async fn claim_pending_files(&self, holder_id: &str, limit: i64) -> Result<Vec<PendingFile>, Error> {
        let cfg = &self.config;
        let metadata_select = if cfg.metadata_columns.is_empty() {
            String::new()
        } else {
            format!(
                ", {}",
                cfg.metadata_columns
                    .iter()
                    .map(|c| format!("{c}::text AS {c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        let select_sql = format!(
            "SELECT {id}, {bucket}, {key}, {size}{meta} FROM {table} \
             WHERE {status} = $1 ORDER BY {id} LIMIT $2 FOR UPDATE SKIP LOCKED",
            id = cfg.id_column,
            bucket = cfg.s3_bucket_column,
            key = cfg.s3_key_column,
            size = cfg.size_column,
            meta = metadata_select,
            table = cfg.table,
            status = cfg.status_column,
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "starting claim transaction: {e}"))?;

        let rows = sqlx::query(&select_sql)
            .bind(&cfg.pending_status)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "selecting pending files from {}: {e}", cfg.table))?;

        let mut files = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get(cfg.id_column.as_str())
                .map_err(|e| make_err!(Code::Internal, "reading {}: {e}", cfg.id_column))?;
            let s3_bucket: String = row.try_get(cfg.s3_bucket_column.as_str())
                .map_err(|e| make_err!(Code::Internal, "reading {}: {e}", cfg.s3_bucket_column))?;
            let s3_key: String = row.try_get(cfg.s3_key_column.as_str())
                .map_err(|e| make_err!(Code::Internal, "reading {}: {e}", cfg.s3_key_column))?;
            let size_bytes: i64 = row.try_get(cfg.size_column.as_str())
                .map_err(|e| make_err!(Code::Internal, "reading {}: {e}", cfg.size_column))?;

            let mut metadata = Map::new();
            for col in &cfg.metadata_columns {
                if let Ok(value) = row.try_get::<String, _>(col.as_str()) {
                    metadata.insert(col.clone(), Value::String(value));
                }
            }

            ids.push(id);
            files.push(PendingFile {
                id,
                shard_id: None,
                s3_bucket,
                s3_key,
                size_bytes,
                metadata,
            });
        }

        if !ids.is_empty() {
            let update_sql = format!(
                "UPDATE {table} SET {status} = $1, {claimed_by} = $2, {claimed_at} = now() \
                 WHERE {id} = ANY($3)",
                table = cfg.table,
                status = cfg.status_column,
                claimed_by = cfg.claimed_by_column,
                claimed_at = cfg.claimed_at_column,
                id = cfg.id_column,
            );
            sqlx::query(&update_sql)
                .bind(&cfg.claimed_status)
                .bind(holder_id)
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| make_err!(Code::Unavailable, "claiming rows in {}: {e}", cfg.table))?;
        }

        tx.commit()
            .await
            .map_err(|e| make_err!(Code::Unavailable, "committing claim transaction: {e}"))?;

        Ok(files)
    }

    pub async fn mark_files_packed(&self, file_ids: &[i64]) -> Result<(), Error> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let cfg = &self.config;
        let sql = format!(
            "UPDATE {table} SET {status} = $1 WHERE {id} = ANY($2)",
            table = cfg.table,
            status = cfg.status_column,
            id = cfg.id_column,
        );
        sqlx::query(&sql)
            .bind(&cfg.packed_status)
            .bind(file_ids)
            .execute(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "marking files packed in {}: {e}", cfg.table))?;
        Ok(())
    }

    pub async fn mark_files_failed(&self, file_ids: &[i64]) -> Result<(), Error> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let cfg = &self.config;
        let sql = format!(
            "UPDATE {table} SET {status} = $1 WHERE {id} = ANY($2)",
            table = cfg.table,
            status = cfg.status_column,
            id = cfg.id_column,
        );
        sqlx::query(&sql)
            .bind(&cfg.pending_status)
            .bind(file_ids)
            .execute(self.pool)
            .await
            .map_err(|e| make_err!(Code::Unavailable, "resetting failed files in {}: {e}", cfg.table))?;
        Ok(())
    }
}
