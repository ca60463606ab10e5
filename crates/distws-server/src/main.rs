use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distws_core::DistributionManager;
use distws_server::{config::Args, create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("distws_server={level},distws_core={level},tower_http=info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config();
    let listen_addr = config.listen_addr();

    // Broker session and listener
    let broker = config.build_broker()?;
    let manager = Arc::new(DistributionManager::new(config.manager.clone(), broker)?);
    manager.startup().await?;

    let state = AppState::new(config.clone(), manager.clone());
    let app = create_router(state);

    let listener = TcpListener::bind(&listen_addr).await?;

    tracing::info!(
        address = %listen_addr,
        broker = manager.broker_name(),
        channel = %manager.channel(),
        auth = config.auth_enabled(),
        "distws server listening"
    );
    tracing::info!("WebSocket endpoint at {}/ws", config.base_url());

    // Close clients before axum waits for their upgraded connections to end.
    let shutdown_manager = manager.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
            shutdown_manager.shutdown().await;
        })
        .await?;

    manager.shutdown().await;
    tracing::info!("server stopped");

    Ok(())
}
