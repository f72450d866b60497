//! Durable backends for the coordinator's `StateStore`

pub mod json;
pub mod postgres;

pub use json::JsonFileStore;
pub use postgres::PostgresStore;

use ai_agent_common::{MemoryStore, StateStore, StorageBackend, StorageConfig};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Open the backend named in `config`
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Json => Arc::new(JsonFileStore::open(&config.path).await?),
        StorageBackend::Postgres => {
            let url = config
                .postgres_url
                .as_deref()
                .context("storage.postgres_url is not set")?;
            Arc::new(PostgresStore::connect(url).await?)
        }
    };

    tracing::info!("State store: {:?}", config.backend);
    Ok(store)
}
