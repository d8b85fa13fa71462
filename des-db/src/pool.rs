//! Connection pool setup, grounded on `des/db/connector.py`'s engine creation.

use des_error::{make_err, Code, Error};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub async fn connect(database_url: &str) -> Result<PgPool, Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| make_err!(Code::Unavailable, "connecting to metadata database: {e}"))
}

/// Runs the `des_shard_locks`, `des_containers`, `des_source_catalog`, and
/// `des_dead_letters` table definitions if they do not already exist, the
/// Rust analogue of `DesDbConnector.init_models`.
pub async fn init_schema(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS des_shard_locks (
            shard_id INTEGER PRIMARY KEY,
            holder_id VARCHAR(128) NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            heartbeat_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            state VARCHAR(32) NOT NULL DEFAULT 'held'
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| make_err!(Code::Internal, "creating des_shard_locks: {e}"))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS des_containers (
            id BIGSERIAL PRIMARY KEY,
            shard_id INTEGER NOT NULL,
            day DATE NOT NULL,
            status VARCHAR(32) NOT NULL,
            s3_key VARCHAR(512) NOT NULL,
            file_count INTEGER NOT NULL DEFAULT 0,
            data_bytes BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            finalized_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| make_err!(Code::Internal, "creating des_containers: {e}"))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS des_source_catalog (
            id BIGSERIAL PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL,
            des_name VARCHAR(255),
            des_hash VARCHAR(64),
            des_shard INTEGER,
            des_status VARCHAR(32),
            des_container_id BIGINT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error VARCHAR(500),
            source_bucket VARCHAR(255),
            source_key VARCHAR(1024),
            claimed_by VARCHAR(128),
            claimed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| make_err!(Code::Internal, "creating des_source_catalog: {e}"))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS des_dead_letters (
            id BIGSERIAL PRIMARY KEY,
            catalog_entry_id BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            error_message TEXT NOT NULL,
            retry_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| make_err!(Code::Internal, "creating des_dead_letters: {e}"))?;

    Ok(())
}
