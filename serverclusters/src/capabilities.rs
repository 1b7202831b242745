//! Capabilities the surrounding proxy / game server provides.
//!
//! The core never talks to a platform directly; everything it needs from the
//! outside world goes through these traits so it can be driven by any host
//! (and by fakes in tests).

use crate::error::ServerUnavailable;
use crate::location::LocationInfo;
use crate::validation::PlayerName;

use async_trait::async_trait;
use uuid::Uuid;

/// Permission required to skip the warp/spawn cooldown.
pub const BYPASS_DELAY_PERMISSION: &str = "serverclusters.bypass.delay";

/// Permission to see hidden clusters.
pub const SEE_HIDDEN_PERMISSION: &str = "serverclusters.seehidden";

/// Whoever issued a command or asks for a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Console,
    Player(Uuid),
}

pub trait PermissionCheck: Send + Sync {
    fn has_permission(&self, subject: Subject, permission: &str) -> bool;
}

/// Vanish integration.
pub trait VisibilityCheck: Send + Sync {
    fn can_see(&self, observer: Subject, player: Uuid) -> bool;
}

/// Used when no vanish plugin is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysVisible;

impl VisibilityCheck for AlwaysVisible {
    fn can_see(&self, _observer: Subject, _player: Uuid) -> bool {
        true
    }
}

/// A player currently connected to the proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct OnlinePlayer {
    pub id: Uuid,
    pub name: PlayerName,
    /// Backend server the player is on right now.
    pub server: String,
}

/// Proxy-side platform operations.
#[async_trait]
pub trait ProxyHost: Send + Sync {
    fn player(&self, id: Uuid) -> Option<OnlinePlayer>;

    /// Case-insensitive lookup.
    fn player_by_name(&self, name: &str) -> Option<OnlinePlayer>;

    /// Move a player to another backend server.
    async fn connect(&self, player: Uuid, server: &str) -> Result<(), ServerUnavailable>;

    /// Send an encoded frame to a backend server. Delivery happens over the
    /// connection of a player on that server, so it may be queued until one
    /// is present.
    async fn send_to_server(&self, server: &str, frame: Vec<u8>) -> Result<(), ServerUnavailable>;

    /// Send an encoded frame over a specific player's server connection; the
    /// backend treats that player as the receiver.
    async fn send_via_player(&self, player: Uuid, frame: Vec<u8>) -> Result<(), ServerUnavailable>;
}

/// Backend-side platform operations.
#[async_trait]
pub trait WorldHost: Send + Sync {
    fn has_world(&self, world: &str) -> bool;

    /// Current location of an online player on this server.
    fn location_of(&self, player: &str) -> Option<LocationInfo>;

    /// Returns false if the player is not (and will not be) on this server.
    async fn teleport_to_location(&self, player: &str, location: &LocationInfo) -> bool;

    /// Returns false if either player is unknown.
    async fn teleport_to_player(&self, player: &str, target: &str) -> bool;
}
