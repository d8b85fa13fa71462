use std::path::PathBuf;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use des_config::load_config;
use des_error::{make_err, Code};
use des_health::HealthChecker;
use des_retriever::{build_cache, build_router, AppState, FileHandler, RetrieverMetrics};
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

    let retriever_config = config
        .retriever
        .clone()
        .ok_or_else(|| make_err!(Code::FailedPrecondition, "config is missing a [retriever] section"))?;

    let pool = des_db::connect(&config.database_url).await?;
    des_db::init_schema(&pool).await?;

    let aws_cfg = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let s3 = aws_sdk_s3::Client::new(&aws_cfg);

    let mut registry = Registry::default();
    let metrics = Arc::new(RetrieverMetrics::new(&mut registry));
    let cache = build_cache(&retriever_config.reader.cache)?;

    let handler = FileHandler::new(
        s3.clone(),
        retriever_config.container_bucket.clone(),
        retriever_config.container_prefix.clone(),
        retriever_config.node.clone(),
        retriever_config.reader.clone(),
        cache,
        metrics.clone(),
    );

    let health = Arc::new(HealthChecker::new(pool, s3, retriever_config.container_bucket.clone(), config.sources.clone()));

    let state = Arc::new(AppState { handler, health, metrics, registry });
    let app = build_router(state);

    let addr: std::net::SocketAddr = retriever_config
        .bind_addr
        .parse()
        .map_err(|e| make_err!(Code::InvalidArgument, "invalid bind_addr '{}': {e}", retriever_config.bind_addr))?;

    tracing::info!(%addr, "starting retriever");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down retriever");
        })
        .await?;

    Ok(())
}
