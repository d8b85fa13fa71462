use std::path::PathBuf;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use des_config::load_config;
use des_packer::{Packer, PackerMetrics};
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

    let aws_cfg = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let s3 = aws_sdk_s3::Client::new(&aws_cfg);

    let mut registry = Registry::default();
    let metrics = Arc::new(PackerMetrics::new(&mut registry));

    let packer = Packer::new(pool, s3, config, metrics);
    let shutdown = packer.shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down packer");
        shutdown.set();
    });

    packer.run_forever().await?;
    Ok(())
}
