use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod api;
mod backup;
mod engine;
mod error;
mod jobs;
mod notify;
mod scheduler;
mod storage;
mod utils;
mod web;

use crate::backup::runner::JobRunner;
use crate::backup::{BackupManager, RecordEnvResolver};
use crate::engine::EngineClient;
use crate::jobs::JobRegistry;
use crate::scheduler::Scheduler;
use crate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting backup orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        engine = %config.engine_path.display(),
        threads = config.engine_threads,
        "Engine configured"
    );

    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    let registry = JobRegistry::new();
    let runner = JobRunner::new(
        EngineClient::new(config.engine_path.clone()),
        Arc::new(RecordEnvResolver),
    );
    let manager = BackupManager::new(config.clone(), storage.clone(), registry.clone(), runner);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = if config.scheduler_enabled {
        let scheduler = Scheduler::new(
            Arc::new(storage.clone()),
            Arc::new(manager.clone()),
            registry.clone(),
            config.scheduler_interval,
        );
        Some(tokio::spawn(async move { scheduler.run(shutdown_rx).await }))
    } else {
        info!("Scheduler disabled");
        None
    };

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .merge(web::static_files::routes(&config.static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(manager);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
    }

    let running = registry.active_count();
    if running > 0 {
        warn!("Exiting with {} job(s) still running", running);
    }
    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
