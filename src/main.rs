use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use chatrelay::config::AppConfig;
use chatrelay::http::{self, AppState};
use chatrelay::providers::ProviderRouter;
use chatrelay::services::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chatrelay=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::debug!(?config, "loaded configuration");

    let db = Database::open(&config.database_path)?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let router = Arc::new(ProviderRouter::from_config(&config, client.clone()));

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, db, router, client);
    let tasks = state.tasks.clone();

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tasks.shutdown().await;
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
