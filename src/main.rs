use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tracing::{error, info};

use db_query_pool::api::routes::create_router_with_state;
use db_query_pool::config::Config;
use db_query_pool::services::ConnectionPoolManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let pool_config = config.pool_config();
    pool_config
        .validate()
        .context("invalid pool configuration")?;
    info!(
        "Pool defaults: max_size={}, batch_size={}",
        pool_config.max_size, pool_config.batch_size
    );
    let pool_manager = Arc::new(ConnectionPoolManager::with_config(pool_config));

    let app: Router = create_router_with_state(pool_manager.clone(), config.clone());

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("invalid server address {}", config.server_address()))?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool_manager.close_all().await;
    info!("All connection pools closed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
