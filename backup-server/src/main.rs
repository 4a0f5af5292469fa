mod config;
mod db;
mod error;
mod models;
mod routes;
mod state;
mod ws;

use crate::config::{AppConfig, Args};
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::state::AppState;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_env()?.with_args(&args)?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting backup server on port {}", config.port);

    std::fs::create_dir_all(&config.data_dir)?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    let state = Arc::new(AppState::new(pool, &config));

    // Runs orphaned by a previous process
    match state.orchestrator.recover_interrupted_runs().await {
        Ok(report) if !report.is_empty() => tracing::warn!(
            definitions_reset = report.definitions_reset,
            runs_failed = report.runs_failed,
            "Reset interrupted backups from a previous run"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!("Recovery scan failed: {}", e),
    }

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
