// Penguin API server

use anyhow::{Context, Result};
use penguin_api::build_router;
use penguin_core::{CoreConfig, ModelBinding, PenguinCore};
use penguin_storage::SqliteStorage;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "penguin_api=debug,penguin_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("penguin-api starting...");

    // Open the snapshot database
    let db_path =
        std::env::var("PENGUIN_DB_PATH").unwrap_or_else(|_| "./penguin.db".to_string());
    let storage = SqliteStorage::open(&db_path).context("Failed to open snapshot database")?;
    tracing::info!(path = %db_path, "snapshot database ready");

    // Default model binding from environment
    let provider =
        std::env::var("PENGUIN_PROVIDER").unwrap_or_else(|_| "replay".to_string());
    let model = std::env::var("PENGUIN_MODEL").unwrap_or_else(|_| "replay-1".to_string());
    let binding = ModelBinding::new(provider.clone(), model);

    let config = CoreConfig::from_env();
    tracing::info!(
        default_agent = %config.default_agent_id,
        max_concurrent = config.max_concurrent_tasks,
        provider = %provider,
        "runtime configured"
    );

    let mut builder = PenguinCore::builder(binding)
        .config(config)
        .snapshot_store(Arc::new(storage.snapshot_store()))
        .session_index(Arc::new(storage.session_index()));

    // The replay adapter keeps the server runnable without credentials;
    // real provider gateways register themselves here.
    if provider == "replay" {
        builder = builder.provider(
            "replay",
            Arc::new(penguin_core::ReplayAdapter::new(Vec::new())),
        );
    }

    let core = builder.build().context("Failed to assemble the runtime")?;

    let app = build_router(core);

    // Start server
    let addr =
        std::env::var("PENGUIN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
