use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use carscrape_client::PageFetcher;
use carscrape_core::config::Settings;
use carscrape_core::retention::RetentionSweeper;
use carscrape_core::store::JobStore;
use carscrape_server::state::AppState;
use carscrape_server::{logging, routes};

/// How long shutdown waits for in-flight webhook deliveries.
const WEBHOOK_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let settings = Settings::from_env()?;
    let log_file = logging::init(&settings.log_dir)?;
    tracing::info!(log_file = %log_file.display(), "Logging initialised");

    let store = match &settings.snapshot_path {
        Some(path) => {
            let store = JobStore::open(path)?;
            tracing::info!(path = %path.display(), jobs = store.len(), "Loaded job snapshot");
            store
        }
        None => JobStore::new(),
    };

    let fetcher = PageFetcher::from_settings(&settings)?;
    tracing::info!(fetcher = fetcher.kind(), "Page fetcher ready");

    let state = Arc::new(AppState::new(&settings, store.clone(), fetcher)?);
    if state.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }

    let shutdown = CancellationToken::new();

    let scheduler = {
        let orchestrator = state.orchestrator.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move { orchestrator.run(token).await })
    };

    let retention = {
        let sweeper = RetentionSweeper::new(store.clone(), settings.retention());
        let token = shutdown.child_token();
        tokio::spawn(async move { sweeper.run(token).await })
    };

    let app = routes::router(state.clone())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", settings.port);
    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    scheduler.await??;
    retention.await?;

    if tokio::time::timeout(WEBHOOK_FLUSH_TIMEOUT, state.orchestrator.flush_webhooks())
        .await
        .is_err()
    {
        tracing::warn!("Gave up waiting for webhook deliveries");
    }

    store.save_snapshot()?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Shutdown signal received"),
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
