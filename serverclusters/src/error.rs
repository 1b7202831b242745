use crate::protocol::ProtocolError;
use crate::validation::ValidationError;

use serverclusters_db::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Destination server is not registered with the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server '{0}' is not available")]
pub struct ServerUnavailable(pub String);

/// Problems building or changing the cluster registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server '{server}' is configured in both cluster '{first}' and cluster '{second}'")]
    ServerInMultipleClusters {
        server: String,
        first: String,
        second: String,
    },

    #[error("cluster name or alias '{0}' is used more than once")]
    DuplicateCluster(String),

    #[error("clusters '{first}' and '{second}' would share the affinity store '{store}'")]
    StoreNameCollision {
        store: String,
        first: String,
        second: String,
    },

    #[error("default server '{default}' of cluster '{cluster}' is not one of its servers")]
    DefaultNotMember { cluster: String, default: String },

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("invalid cluster definition: {0}")]
    Invalid(#[from] ValidationError),

    #[error("affinity storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcomes of teleport operations that did not go through.
///
/// Everything except [`TeleportError::Protocol`] is a user-facing rejection
/// and is reported to the player rather than logged.
#[derive(Debug, Error)]
pub enum TeleportError {
    #[error("you have no pending teleport request")]
    NoPendingRequest,

    #[error("you have to wait {} more seconds", .0.as_secs_f64().ceil())]
    CooldownActive(Duration),

    #[error("you cannot send a teleport request to yourself")]
    SelfRequest,

    #[error("player '{0}' is not online")]
    UnknownPlayer(String),

    #[error(transparent)]
    ServerUnavailable(#[from] ServerUnavailable),

    #[error("no location reply from '{0}' in time")]
    LocationTimeout(String),

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl TeleportError {
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, TeleportError::Protocol(_))
    }
}
