//! Lumyn API server binary.

#![deny(unsafe_code)]

use std::sync::Arc;

use api::ApiConfig;
use store::SqliteStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_json_logging();

    let config = ApiConfig::from_env();
    let store = Arc::new(SqliteStore::open(&config.store_path)?);
    let app = api::router(config.engine_config(), store);

    let addr = std::env::var("LUMYN_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "lumyn api listening");
    axum::serve(listener, app).await?;
    Ok(())
}
