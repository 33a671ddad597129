//! Storage backends for the view-through attribution pipeline.

pub mod clickhouse_store;
pub mod memory;
pub mod traits;

pub use clickhouse_store::ClickHouseStore;
pub use memory::InMemoryStore;
pub use traits::{ClickResultStore, ClickedPlatforms, EventStore, ResultStore, SummaryStore};

use std::sync::Arc;
use tracing::info;
use viewthrough_core::config::{AppConfig, StoreBackend};

/// Handles to every store the pipeline reads from or writes to.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub results: Arc<dyn ResultStore>,
    pub summaries: Arc<dyn SummaryStore>,
    pub clicks: Arc<dyn ClickResultStore>,
}

impl Stores {
    /// Use one backend for every role.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EventStore + ResultStore + SummaryStore + ClickResultStore + 'static,
    {
        Self {
            events: backend.clone(),
            results: backend.clone(),
            summaries: backend.clone(),
            clicks: backend,
        }
    }

    /// Build the configured backend.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory store backend");
                Ok(Self::from_backend(Arc::new(InMemoryStore::new())))
            }
            StoreBackend::ClickHouse => {
                let store = ClickHouseStore::new(&config.clickhouse).await?;
                Ok(Self::from_backend(Arc::new(store)))
            }
        }
    }
}
