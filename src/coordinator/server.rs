//! Coordinator server

use crate::common::{MasterConfig, Result};
use crate::coordinator::http::create_router;
use crate::coordinator::lock::KeyLocks;
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::placement::PlacementManager;
use crate::coordinator::volume_client::{HttpVolumeClient, VolumeClient};
use crate::ops::{rebalance_cluster, rebuild_cluster, RebalanceReport, RebuildReport};
use std::sync::Arc;

/// Everything a request handler or background job needs.
#[derive(Clone)]
pub struct CoordState {
    pub config: Arc<MasterConfig>,
    pub metadata: MetadataStore,
    pub placement: Arc<PlacementManager>,
    pub locks: Arc<KeyLocks>,
    pub volumes: Arc<dyn VolumeClient>,
}

impl CoordState {
    pub fn new(
        config: MasterConfig,
        metadata: MetadataStore,
        volumes: Arc<dyn VolumeClient>,
    ) -> Self {
        let placement = Arc::new(PlacementManager::from_config(&config));
        Self {
            config: Arc::new(config),
            metadata,
            placement,
            locks: Arc::new(KeyLocks::new()),
            volumes,
        }
    }
}

pub struct Coordinator {
    config: MasterConfig,
}

impl Coordinator {
    /// Validates the configuration; a bad topology never reaches `serve`.
    pub fn new(config: MasterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn open_state(&self) -> Result<CoordState> {
        let metadata = MetadataStore::open(&self.config.db_path)?;
        let volumes: Arc<dyn VolumeClient> = Arc::new(HttpVolumeClient::new()?);
        Ok(CoordState::new(self.config.clone(), metadata, volumes))
    }

    pub async fn serve(self) -> Result<()> {
        let state = self.open_state()?;

        tracing::info!("Starting mkv master");
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Volumes: {}", state.placement.volumes().join(","));
        tracing::info!(
            "  Replicas: {}, subvolumes: {}",
            state.placement.replicas(),
            state.placement.subvolumes()
        );
        if self.config.protect {
            tracing::info!("  Protect: DELETE of active keys requires UNLINK first");
        }

        let router = create_router(state);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!("✓ Master ready");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }

    pub async fn rebalance(self) -> Result<RebalanceReport> {
        let state = self.open_state()?;
        rebalance_cluster(&state).await
    }

    pub async fn rebuild(self) -> Result<RebuildReport> {
        let state = self.open_state()?;
        rebuild_cluster(&state).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
