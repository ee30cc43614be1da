// src/main.rs
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use meshgate::config::Config;
use meshgate::db::Database;
use meshgate::routes::create_router;
use meshgate::services::dispatcher::HttpNodeTransport;
use meshgate::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("meshgate=info,tower_http=info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting meshgate control plane...");

    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Connecting to database: {}", config.database_url);
    let db = Database::new(&config.database_url)
        .await
        .context("failed to open database")?;
    tracing::info!("Running database migrations...");
    db.migrate().await.context("failed to run migrations")?;

    let transport = Arc::new(
        HttpNodeTransport::new(config.node_command_timeout)
            .context("failed to build node command client")?,
    );
    let state = AppState::new(db, config.clone(), transport)?;

    if config.enable_background_jobs {
        tracing::info!("Starting maintenance scheduler...");
        state.scheduler.start().await;
    }

    let app = create_router(state.clone());
    let addr = config.server_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("meshgate listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Stopping maintenance scheduler...");
    state.scheduler.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
