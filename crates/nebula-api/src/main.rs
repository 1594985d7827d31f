use nebuladb_api::{router, ApiConfig, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const KEY_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ApiConfig::from_env();
    tracing::info!(metadata_db = %config.metadata_db.display(), "Using metadata store");

    let (state, usage_worker) = AppState::build(&config).unwrap_or_else(|e| {
        tracing::error!("Failed to initialize: {}", e);
        std::process::exit(1);
    });

    let api_keys = state.api_keys.clone();
    let flusher = tokio::spawn(async move {
        let mut interval = tokio::time::interval(KEY_FLUSH_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = api_keys.flush_pending_updates().await {
                tracing::warn!(error = %e, "Failed to flush API key usage");
            }
        }
    });

    let pool = state.pool.clone();
    let api_keys = state.api_keys.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("NebulaDB API listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = served {
        tracing::error!("Server error: {}", e);
    }

    flusher.abort();
    if let Err(e) = api_keys.flush_pending_updates().await {
        tracing::warn!(error = %e, "Failed to flush API key usage");
    }
    usage_worker.shutdown(config.usage.shutdown_timeout()).await;
    let released = pool.release_all().await;
    tracing::info!(released = released, "Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
