mod config;
mod error;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use ward_core::conflict::ConflictWatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ward_api=info".parse()?)
                .add_directive("ward_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting ward-api with config: {:?}", config);

    let state = AppState::open(config).await?;
    let watcher = ConflictWatcher::spawn(state.store.clone());
    let mut notifications = watcher.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => tracing::warn!(
                    document = %notification.document_id,
                    revisions = ?notification.conflicting_revision_ids,
                    "Conflict flagged for review"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Conflict notification log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("ward-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    watcher.stop();
    Ok(())
}
