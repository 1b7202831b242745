pub mod affinity;
pub mod backend;
pub mod capabilities;
pub mod cluster;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod helpers;
pub mod location;
pub mod protocol;
pub mod registry;
pub mod teleport;
pub mod validation;

pub use backend::{BackendListener, CommandSender};
pub use capabilities::{
    AlwaysVisible, OnlinePlayer, PermissionCheck, ProxyHost, Subject, VisibilityCheck, WorldHost,
};
pub use cluster::Cluster;
pub use config::{ClusterDefinition, Config};
pub use error::{RegistryError, ServerUnavailable, TeleportError};
pub use location::{LocationInfo, WarpInfo};
pub use protocol::{ErrorKind, Message, ProtocolError};
pub use registry::ClusterRegistry;
pub use teleport::{Inbound, PlayerState, TeleportCoordinator, TeleportRequest};

use crate::config::{AffinityStoreOpener, TeleportSettings};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Proxy-side state shared by every listener and command handler.
pub struct ServerClusters {
    pub registry: Arc<RwLock<ClusterRegistry>>,
    pub teleports: Arc<TeleportCoordinator>,
}

impl ServerClusters {
    pub async fn start(
        defs: &[ClusterDefinition],
        opener: Arc<dyn AffinityStoreOpener>,
        settings: TeleportSettings,
        proxy: Arc<dyn ProxyHost>,
        permissions: Arc<dyn PermissionCheck>,
    ) -> Result<Self, RegistryError> {
        let registry = Arc::new(RwLock::new(
            ClusterRegistry::from_definitions(defs, opener).await?,
        ));
        let teleports = Arc::new(TeleportCoordinator::new(
            proxy,
            permissions,
            registry.clone(),
            settings,
        ));
        Ok(Self {
            registry,
            teleports,
        })
    }

    /// Swap in a registry built from `defs`. The old registry is shut down
    /// only once the new one loaded; on error it stays in place.
    pub async fn reload(&self, defs: &[ClusterDefinition]) -> Result<(), RegistryError> {
        // no affinity writes reach the old stores while the new ones load
        let mut registry = self.registry.write().await;
        let fresh = ClusterRegistry::from_definitions(defs, registry.opener().clone()).await?;
        let mut old = std::mem::replace(&mut *registry, fresh);
        old.shutdown().await;
        info!(clusters = registry.len(), "clusters reloaded");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.registry.write().await.shutdown().await;
    }
}
