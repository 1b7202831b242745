use anyhow::Context;
use serverclusters::ClusterRegistry;
use serverclusters::config::{Config, load_cluster_definitions};
use std::sync::Arc;

/// Loads the cluster definitions, opens every affinity store and reports
/// the resulting routing table. Exits non-zero on an invalid configuration.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    let log_level = if config.debug || cfg!(debug_assertions) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Starting ServerClusters...");
    tracing::info!(
        "Configuration: clusters={}, storage={:?} at {}, cache_size={}, teleport_delay={}s, request_timeout={}s, location_timeout={}s",
        config.clusters_path.display(),
        config.storage_backend,
        config.storage_path.display(),
        config.affinity_cache_size,
        config.teleport_delay.as_secs(),
        config.request_timeout.as_secs(),
        config.location_timeout.as_secs()
    );

    let defs = load_cluster_definitions(&config.clusters_path)
        .await
        .with_context(|| format!("loading {}", config.clusters_path.display()))?;
    let mut registry = ClusterRegistry::from_definitions(&defs, Arc::new(config.storage_settings()))
        .await
        .context("invalid cluster configuration")?;

    for cluster in registry.clusters() {
        tracing::info!(
            "Cluster '{}': servers={:?}, default={}, aliases={:?}, hidden={}, logout_affinity={}",
            cluster.name(),
            cluster.servers(),
            cluster.default_server(),
            cluster.aliases(),
            cluster.is_hidden(),
            cluster.tracks_affinity()
        );
    }

    registry.shutdown().await;
    tracing::info!("Configuration OK");
    Ok(())
}
