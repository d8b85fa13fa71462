use std::path::PathBuf;
use std::sync::Arc;

use des_config::load_config;
use des_marker::{MarkerMetrics, MarkerWorker};
use prometheus_client::registry::Registry;

fn config_path() -> PathBuf {
    std::env::var("DES_CONFIG_PATH")
        .unwrap_or_else(|_| std::env::args().nth(1).unwrap_or_else(|| "des.json5".to_string()))
        .into()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&config_path())?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.logging.level.clone()))
        .init();

    let pool = des_db::connect(&config.database_url).await?;
    des_db::init_schema(&pool).await?;

    let mut registry = Registry::default();
    let metrics = Arc::new(MarkerMetrics::new(&mut registry));

    let worker = Arc::new(MarkerWorker::new(pool, config.marker, metrics)?);

    let shutdown = worker.shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down marker worker");
        shutdown.set();
    });

    worker.run_forever().await;
    Ok(())
}
