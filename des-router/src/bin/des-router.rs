use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use des_config::load_config;
use des_error::{make_err, Code};
use des_router::{build_router, AppState, RouterMetrics, RoutingTable};
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

    let router_config = config
        .router
        .clone()
        .ok_or_else(|| make_err!(Code::FailedPrecondition, "config is missing a [router] section"))?;

    let mut registry = Registry::default();
    let metrics = Arc::new(RouterMetrics::new(&mut registry));

    let table = RoutingTable::new(
        router_config.retrievers.clone(),
        router_config.strategy,
        router_config.cb_threshold,
        router_config.cb_timeout_secs,
    );

    let client = reqwest::Client::builder().timeout(Duration::from_secs(router_config.request_timeout_secs)).build()?;

    let bind_addr = router_config.bind_addr.clone();
    let state = Arc::new(AppState { table, client, config: router_config, metrics, registry });
    let app = build_router(state);

    let addr: std::net::SocketAddr =
        bind_addr.parse().map_err(|e| make_err!(Code::InvalidArgument, "invalid bind_addr '{bind_addr}': {e}"))?;

    tracing::info!(%addr, "starting router");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("ctrl-c received, shutting down router");
        })
        .await?;

    Ok(())
}
