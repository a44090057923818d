// Main entry point for the codeq server

use std::sync::Arc;

use anyhow::{Context, Result};
use codeq_core::kernel::{kv::Kv, sweepers};
use codeq_core::server::app::{build_app, AppState};
use codeq_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,codeq_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting codeq task queue");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    tracing::info!(url = %config.kv_url, "Connecting to KV store...");
    let kv = Kv::connect(&config.kv_url).await?;
    kv.ping().await.context("KV store did not answer PING")?;
    tracing::info!("KV store connected");

    let state = AppState::build(kv, Arc::clone(&config))?;

    // Background sweepers (delayed promotion, subscription + ttl cleanup)
    let shutdown = CancellationToken::new();
    let sweeper_handles = sweepers::spawn_all(
        Arc::clone(&state.repo),
        Arc::clone(&state.subscriptions),
        Arc::clone(&state.metrics),
        Arc::clone(&config),
        shutdown.clone(),
    );

    let app = build_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    for handle in sweeper_handles {
        let _ = handle.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
