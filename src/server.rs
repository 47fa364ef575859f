use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{self, AppState, SharedState};
use crate::config::DevflowConfig;
use crate::engine::db::{DbHandle, RunDb};
use crate::engine::{EventLog, RunRegistry};
use crate::llm::build_providers;

/// How long in-flight runs get to reach a checkpoint on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Build the full application router.
pub fn build_router(state: SharedState, permissive_cors: bool) -> Router {
    let mut app = api::api_router().with_state(state).layer(TraceLayer::new_for_http());
    if permissive_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the run store at `path`.
pub fn open_db(path: &Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = RunDb::new(path).context("Failed to initialize run database")?;
    Ok(DbHandle::new(db))
}

/// Start the API server and block until Ctrl+C.
pub async fn start_server(config: DevflowConfig, dev_mode: bool) -> Result<()> {
    let db = open_db(&config.server.db_path)?;
    let providers = build_providers(&config.models).context("Failed to configure model providers")?;
    let config = Arc::new(config);

    let registry = RunRegistry::new(EventLog::new(db), config.clone(), Arc::new(providers));
    let recovered = registry.recover_on_startup().await?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "failed runs interrupted by the previous process");
    }

    let state = Arc::new(AppState {
        registry: registry.clone(),
    });
    let app = build_router(state, dev_mode || config.server.cors_permissive);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, db = %config.server.db_path.display(), "DevFlow API listening");
    println!("DevFlow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
