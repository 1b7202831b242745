use crate::affinity::LogoutAffinityCache;
use crate::capabilities::{PermissionCheck, SEE_HIDDEN_PERMISSION, Subject};
use crate::config::{AffinityStoreOpener, ClusterDefinition};
use crate::error::RegistryError;
use crate::helpers::affinity_store_name;
use crate::location::WarpInfo;
use crate::validation::{
    ValidationError, validate_cluster_name, validate_server_name, validate_warp_name,
};

use serverclusters_db::StorageError;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A named group of backend servers sharing warps and logout affinity.
pub struct Cluster {
    name: String,
    /// Never empty.
    members: Vec<String>,
    aliases: Vec<String>,
    /// Always one of `members` when set.
    default_server: Option<String>,
    hidden: bool,
    ignore_logout_affinity: bool,
    /// Keyed by lower-cased warp name.
    warps: HashMap<String, WarpInfo>,
    /// Present iff there is more than one member and affinity is tracked.
    affinity: Option<LogoutAffinityCache>,
}

impl Cluster {
    pub async fn new(
        name: &str,
        servers: &[&str],
        opener: &dyn AffinityStoreOpener,
    ) -> Result<Self, RegistryError> {
        Self::from_definition(&ClusterDefinition::new(name, servers), opener).await
    }

    /// Build a cluster from its definition, opening the affinity store if
    /// the cluster tracks logout servers.
    pub async fn from_definition(
        def: &ClusterDefinition,
        opener: &dyn AffinityStoreOpener,
    ) -> Result<Self, RegistryError> {
        validate_cluster_name(&def.name)?;
        if def.servers.is_empty() {
            return Err(ValidationError::ClusterWithoutServers(def.name.clone()).into());
        }
        for server in &def.servers {
            validate_server_name(server)?;
        }

        let mut members: Vec<String> = Vec::with_capacity(def.servers.len());
        for server in &def.servers {
            if !members.iter().any(|m| m.eq_ignore_ascii_case(server)) {
                members.push(server.clone());
            }
        }

        let mut cluster = Self {
            name: def.name.clone(),
            members,
            aliases: def.aliases.clone(),
            default_server: None,
            hidden: def.hidden,
            ignore_logout_affinity: def.ignore_logout_server,
            warps: HashMap::new(),
            affinity: None,
        };

        if let Some(default) = &def.default {
            if !cluster.set_default_server(Some(default)) {
                return Err(RegistryError::DefaultNotMember {
                    cluster: def.name.clone(),
                    default: default.clone(),
                });
            }
        }

        cluster.ensure_affinity(opener).await?;
        info!(
            cluster = %cluster.name,
            servers = ?cluster.members,
            tracks_affinity = cluster.tracks_affinity(),
            "cluster loaded"
        );
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn servers(&self) -> &[String] {
        &self.members
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self, hidden: bool) {
        self.hidden = hidden;
    }

    pub fn ignores_logout_affinity(&self) -> bool {
        self.ignore_logout_affinity
    }

    /// Whether logout servers are recorded and consulted for this cluster.
    pub fn tracks_affinity(&self) -> bool {
        self.affinity.is_some()
    }

    pub fn affinity_cache(&self) -> Option<&LogoutAffinityCache> {
        self.affinity.as_ref()
    }

    /// Permission to use this cluster.
    pub fn permission(&self) -> String {
        format!("serverclusters.cluster.{}", self.name.to_lowercase())
    }

    /// Server players join when they have no logout server here.
    pub fn default_server(&self) -> &str {
        self.default_server
            .as_deref()
            .unwrap_or(self.members[0].as_str())
    }

    /// Returns false (and changes nothing) if `server` is not a member.
    pub fn set_default_server(&mut self, server: Option<&str>) -> bool {
        match server {
            None => {
                self.default_server = None;
                true
            }
            Some(server) => match self.member(server) {
                Some(member) => {
                    self.default_server = Some(member.to_string());
                    true
                }
                None => false,
            },
        }
    }

    pub fn contains_server(&self, server: &str) -> bool {
        self.member(server).is_some()
    }

    /// Canonical spelling of a member server name.
    fn member(&self, server: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.eq_ignore_ascii_case(server))
            .map(String::as_str)
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Add a member server. Growing from one to two servers starts affinity
    /// tracking, which may open a store. Returns false for a duplicate.
    pub async fn add_server(
        &mut self,
        server: &str,
        opener: &dyn AffinityStoreOpener,
    ) -> Result<bool, RegistryError> {
        validate_server_name(server)?;
        if self.contains_server(server) {
            return Ok(false);
        }
        self.members.push(server.to_lowercase());
        if let Err(err) = self.ensure_affinity(opener).await {
            self.members.pop();
            return Err(err.into());
        }
        debug!(cluster = %self.name, server, "server added to cluster");
        Ok(true)
    }

    async fn ensure_affinity(
        &mut self,
        opener: &dyn AffinityStoreOpener,
    ) -> Result<(), StorageError> {
        if self.affinity.is_some() || self.members.len() < 2 || self.ignore_logout_affinity {
            return Ok(());
        }
        let storage = opener.open_store(&affinity_store_name(&self.name)).await?;
        self.affinity = Some(LogoutAffinityCache::new(storage, opener.cache_capacity()));
        Ok(())
    }

    /// Remember the server a player disconnected from. Ignored when the
    /// cluster does not track affinity or `server` is not a member.
    pub async fn set_logout_server(&self, player: Uuid, server: &str) {
        let (Some(cache), Some(member)) = (&self.affinity, self.member(server)) else {
            return;
        };
        if let Err(err) = cache.put(player, member.to_string()).await {
            warn!(cluster = %self.name, %player, error = %err, "could not persist logout server");
        }
    }

    /// Server the player last disconnected from. Always `None`, without
    /// touching storage, when the cluster does not track affinity.
    pub async fn logout_server(&self, player: Uuid) -> Option<String> {
        let cache = self.affinity.as_ref()?;
        match cache.get(player).await {
            Ok(server) => server.filter(|s| self.contains_server(s)),
            Err(err) => {
                warn!(cluster = %self.name, %player, error = %err, "could not load logout server");
                None
            }
        }
    }

    /// Server a player should be sent to when joining this cluster.
    pub async fn resolve_connect_target(&self, player: Uuid) -> String {
        match self.logout_server(player).await {
            Some(server) => server,
            None => self.default_server().to_string(),
        }
    }

    pub fn warp(&self, name: &str) -> Option<&WarpInfo> {
        self.warps.get(&name.to_lowercase())
    }

    pub fn warps(&self) -> impl Iterator<Item = &WarpInfo> {
        self.warps.values()
    }

    pub fn warps_visible_to<'a>(
        &'a self,
        subject: Subject,
        permissions: &'a dyn PermissionCheck,
    ) -> impl Iterator<Item = &'a WarpInfo> + 'a {
        self.warps
            .values()
            .filter(move |warp| permissions.has_permission(subject, warp.permission()))
    }

    /// Add or replace a warp; returns the replaced one.
    pub fn add_warp(&mut self, warp: WarpInfo) -> Result<Option<WarpInfo>, ValidationError> {
        validate_warp_name(warp.name())?;
        Ok(self.warps.insert(warp.key(), warp))
    }

    pub fn remove_warp(&mut self, name: &str) -> Option<WarpInfo> {
        self.warps.remove(&name.to_lowercase())
    }

    pub fn has_access(&self, subject: Subject, permissions: &dyn PermissionCheck) -> bool {
        permissions.has_permission(subject, &self.permission())
    }

    /// Hidden clusters only show up for subjects allowed to see them.
    pub fn can_see(&self, subject: Subject, permissions: &dyn PermissionCheck) -> bool {
        !self.hidden
            || permissions.has_permission(subject, SEE_HIDDEN_PERMISSION)
            || permissions.has_permission(subject, &format!("{}.see", self.permission()))
    }

    /// Close the affinity store.
    pub async fn destroy(&self) {
        if let Some(cache) = &self.affinity {
            cache.close().await;
        }
    }

    pub fn cmp_by_name(&self, other: &Cluster) -> Ordering {
        self.name
            .to_lowercase()
            .cmp(&other.name.to_lowercase())
    }
}
