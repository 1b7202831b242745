use crate::capabilities::{OnlinePlayer, PermissionCheck, ProxyHost, Subject, VisibilityCheck};
use crate::cluster::Cluster;
use crate::config::{AffinityStoreOpener, ClusterDefinition};
use crate::error::{RegistryError, TeleportError};
use crate::helpers::affinity_store_name;
use crate::validation::{ValidationError, validate_cluster_name};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// All configured clusters, indexed by name, alias and member server.
///
/// Owners share it as `Arc<tokio::sync::RwLock<ClusterRegistry>>`; lookups
/// and affinity updates only need the read half.
pub struct ClusterRegistry {
    /// Sorted by name, case-insensitive.
    clusters: Vec<Cluster>,
    /// Lower-cased name or alias -> index into `clusters`.
    by_name: HashMap<String, usize>,
    /// Lower-cased server -> index into `clusters`.
    by_server: HashMap<String, usize>,
    opener: Arc<dyn AffinityStoreOpener>,
}

impl ClusterRegistry {
    pub fn empty(opener: Arc<dyn AffinityStoreOpener>) -> Self {
        Self {
            clusters: Vec::new(),
            by_name: HashMap::new(),
            by_server: HashMap::new(),
            opener,
        }
    }

    /// Build the registry. Every definition is checked before any affinity
    /// store is opened, so a rejected configuration leaves nothing open.
    pub async fn from_definitions(
        defs: &[ClusterDefinition],
        opener: Arc<dyn AffinityStoreOpener>,
    ) -> Result<Self, RegistryError> {
        check_definitions(defs)?;

        let mut clusters = Vec::with_capacity(defs.len());
        for def in defs {
            match Cluster::from_definition(def, opener.as_ref()).await {
                Ok(cluster) => clusters.push(cluster),
                Err(err) => {
                    for cluster in &clusters {
                        cluster.destroy().await;
                    }
                    return Err(err);
                }
            }
        }
        clusters.sort_by(Cluster::cmp_by_name);

        let mut registry = Self {
            clusters,
            by_name: HashMap::new(),
            by_server: HashMap::new(),
            opener,
        };
        registry.reindex();
        info!(clusters = registry.clusters.len(), "cluster registry loaded");
        Ok(registry)
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        self.by_server.clear();
        for (idx, cluster) in self.clusters.iter().enumerate() {
            self.by_name.insert(cluster.name().to_lowercase(), idx);
            for alias in cluster.aliases() {
                self.by_name.insert(alias.to_lowercase(), idx);
            }
            for server in cluster.servers() {
                self.by_server.insert(server.to_lowercase(), idx);
            }
        }
    }

    /// Lookup by name or alias.
    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&idx| &self.clusters[idx])
    }

    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        let idx = *self.by_name.get(&name.to_lowercase())?;
        Some(&mut self.clusters[idx])
    }

    /// The cluster a backend server belongs to.
    pub fn cluster_by_server(&self, server: &str) -> Option<&Cluster> {
        self.by_server
            .get(&server.to_lowercase())
            .map(|&idx| &self.clusters[idx])
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Clusters the subject may use and, for hidden ones, see.
    pub fn visible_clusters<'a>(
        &'a self,
        subject: Subject,
        permissions: &dyn PermissionCheck,
    ) -> Vec<&'a Cluster> {
        self.clusters
            .iter()
            .filter(|c| c.has_access(subject, permissions) && c.can_see(subject, permissions))
            .collect()
    }

    /// Add a server to a cluster at runtime. A server already owned by a
    /// different cluster is rejected.
    pub async fn add_server(&mut self, cluster: &str, server: &str) -> Result<bool, RegistryError> {
        let idx = *self
            .by_name
            .get(&cluster.to_lowercase())
            .ok_or_else(|| RegistryError::UnknownCluster(cluster.to_string()))?;

        if let Some(&owner) = self.by_server.get(&server.to_lowercase()) {
            if owner != idx {
                return Err(RegistryError::ServerInMultipleClusters {
                    server: server.to_string(),
                    first: self.clusters[owner].name().to_string(),
                    second: self.clusters[idx].name().to_string(),
                });
            }
            return Ok(false);
        }

        let added = self.clusters[idx]
            .add_server(server, self.opener.as_ref())
            .await?;
        if added {
            self.by_server.insert(server.to_lowercase(), idx);
        }
        Ok(added)
    }

    /// Record the server a player disconnected from in the cluster owning it.
    pub async fn on_player_disconnect(&self, player: Uuid, server: &str) {
        match self.cluster_by_server(server) {
            Some(cluster) => cluster.set_logout_server(player, server).await,
            None => debug!(%player, server, "disconnect from a server outside any cluster"),
        }
    }

    /// Send a player to the server they should join in `cluster`. Returns the
    /// server they were connected to.
    pub async fn connect_player(
        &self,
        player: Uuid,
        cluster: &str,
        proxy: &dyn ProxyHost,
    ) -> Result<String, TeleportError> {
        let cluster = self
            .cluster(cluster)
            .ok_or_else(|| TeleportError::UnknownCluster(cluster.to_string()))?;
        let target = cluster.resolve_connect_target(player).await;
        proxy.connect(player, &target).await?;
        debug!(%player, cluster = %cluster.name(), server = %target, "connecting player to cluster");
        Ok(target)
    }

    /// The cluster hosting `player`, if `subject` may see both the player and
    /// that cluster.
    pub fn find_player(
        &self,
        subject: Subject,
        player: &OnlinePlayer,
        visibility: &dyn VisibilityCheck,
        permissions: &dyn PermissionCheck,
    ) -> Option<&Cluster> {
        if !visibility.can_see(subject, player.id) {
            return None;
        }
        self.cluster_by_server(&player.server)
            .filter(|cluster| cluster.can_see(subject, permissions))
    }

    pub fn opener(&self) -> &Arc<dyn AffinityStoreOpener> {
        &self.opener
    }

    /// Destroy every cluster, closing their affinity stores.
    pub async fn shutdown(&mut self) {
        for cluster in &self.clusters {
            cluster.destroy().await;
        }
        self.clusters.clear();
        self.by_name.clear();
        self.by_server.clear();
        info!("cluster registry shut down");
    }
}

/// Structural checks across all definitions.
fn check_definitions(defs: &[ClusterDefinition]) -> Result<(), RegistryError> {
    let mut names: HashMap<String, usize> = HashMap::new();
    let mut servers: HashMap<String, &str> = HashMap::new();
    // store name -> cluster; `-` and `_` map to the same store
    let mut stores: HashMap<String, &str> = HashMap::new();

    for (idx, def) in defs.iter().enumerate() {
        validate_cluster_name(&def.name)?;
        if def.servers.is_empty() {
            return Err(ValidationError::ClusterWithoutServers(def.name.clone()).into());
        }

        for name in std::iter::once(&def.name).chain(def.aliases.iter()) {
            let owner = *names.entry(name.to_lowercase()).or_insert(idx);
            if owner != idx {
                return Err(RegistryError::DuplicateCluster(name.clone()));
            }
        }

        let store = affinity_store_name(&def.name);
        if let Some(first) = stores.get(&store) {
            return Err(RegistryError::StoreNameCollision {
                store,
                first: first.to_string(),
                second: def.name.clone(),
            });
        }
        stores.insert(store, def.name.as_str());

        for server in &def.servers {
            let key = server.to_lowercase();
            if let Some(first) = servers.get(&key) {
                if *first != def.name.as_str() {
                    return Err(RegistryError::ServerInMultipleClusters {
                        server: server.clone(),
                        first: first.to_string(),
                        second: def.name.clone(),
                    });
                }
            }
            servers.insert(key, def.name.as_str());
        }

        if let Some(default) = &def.default {
            if !def.servers.iter().any(|s| s.eq_ignore_ascii_case(default)) {
                return Err(RegistryError::DefaultNotMember {
                    cluster: def.name.clone(),
                    default: default.clone(),
                });
            }
        }
    }
    Ok(())
}
