//! Proxy-side teleport state: consent requests, the throttled-command
//! cooldown and cross-server execution of teleports over the backend
//! protocol.

use crate::capabilities::{BYPASS_DELAY_PERMISSION, OnlinePlayer, PermissionCheck, ProxyHost, Subject};
use crate::config::TeleportSettings;
use crate::cooldown::CooldownTracker;
use crate::error::TeleportError;
use crate::helpers::millis_after;
use crate::location::LocationInfo;
use crate::protocol::{ErrorKind, GET_LOCATION, Message, Position, ProtocolError, RunCommand};
use crate::registry::ClusterRegistry;
use crate::validation::{PlayerName, validate_player_name};

use scc::hash_map::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Commands subject to the cooldown.
pub const THROTTLED_COMMANDS: [&str; 2] = ["warp", "spawn"];

pub fn is_throttled(command: &str) -> bool {
    THROTTLED_COMMANDS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(command))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeleportRequest {
    pub requester: Uuid,
    pub requester_name: PlayerName,
    pub target: Uuid,
    pub created_at: i64,
    pub expires_at: i64,
}

impl TeleportRequest {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    PendingOutboundRequest,
    PendingInboundRequest,
    Cooldown(Duration),
}

/// What became of a frame a backend sent to the proxy.
#[derive(Debug)]
pub enum Inbound {
    /// A pending location query was answered.
    LocationDelivered,
    /// Location reply nobody was waiting for (late or duplicate).
    LocationUnclaimed,
    /// A backend asked for a teleport and it was carried out.
    Teleported,
    /// Error report from a backend; the caller tells the affected player.
    BackendError { kind: ErrorKind, detail: String },
    /// A forwarded command for the command layer.
    Command(RunCommand),
    /// A forwarded `tpaccept` that was executed here.
    Accepted(TeleportRequest),
    /// Frame the proxy has no use for.
    Ignored(&'static str),
    /// Malformed frame answered with a `malformed message` error.
    Bounced(ProtocolError),
    /// Malformed frame without a usable channel.
    Dropped(ProtocolError),
}

pub struct TeleportCoordinator {
    proxy: Arc<dyn ProxyHost>,
    permissions: Arc<dyn PermissionCheck>,
    registry: Arc<RwLock<ClusterRegistry>>,
    settings: TeleportSettings,
    cooldowns: Arc<CooldownTracker>,
    /// target -> live requests, oldest first.
    requests: scc::HashMap<Uuid, Vec<TeleportRequest>>,
    /// requester -> targets they may have asked; checked against `requests`.
    outbound: scc::HashMap<Uuid, HashSet<Uuid>>,
    /// (reason, sender) of an outstanding get-location query.
    pending_locations: scc::HashMap<(String, String), PendingQuery>,
    next_query: AtomicU64,
}

/// A get-location query waiting for the backend hosting `target`.
struct PendingQuery {
    server: String,
    target: PlayerName,
    reply: oneshot::Sender<LocationInfo>,
}

impl TeleportCoordinator {
    pub fn new(
        proxy: Arc<dyn ProxyHost>,
        permissions: Arc<dyn PermissionCheck>,
        registry: Arc<RwLock<ClusterRegistry>>,
        settings: TeleportSettings,
    ) -> Self {
        Self {
            proxy,
            permissions,
            registry,
            cooldowns: Arc::new(CooldownTracker::new(settings.teleport_delay)),
            settings,
            requests: scc::HashMap::new(),
            outbound: scc::HashMap::new(),
            pending_locations: scc::HashMap::new(),
            next_query: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<ClusterRegistry>> {
        &self.registry
    }

    pub fn cooldowns(&self) -> &Arc<CooldownTracker> {
        &self.cooldowns
    }

    pub async fn record_usage(&self, player: Uuid, now: i64) {
        self.cooldowns.record_usage(player, now).await;
    }

    pub async fn check_cooldown(&self, player: Uuid, now: i64) -> Result<(), TeleportError> {
        self.cooldowns.check(player, now).await
    }

    pub async fn player_state(&self, player: Uuid, now: i64) -> PlayerState {
        let remaining = self.cooldowns.remaining(player, now).await;
        if !remaining.is_zero() {
            return PlayerState::Cooldown(remaining);
        }

        let targets = self
            .outbound
            .read_async(&player, |_, targets| targets.clone())
            .await
            .unwrap_or_default();
        for target in targets {
            let live = self
                .requests
                .read_async(&target, |_, list| {
                    list.iter().any(|r| r.requester == player && !r.is_expired(now))
                })
                .await
                .unwrap_or(false);
            if live {
                return PlayerState::PendingOutboundRequest;
            }
        }

        let inbound = self
            .requests
            .read_async(&player, |_, list| list.iter().any(|r| !r.is_expired(now)))
            .await
            .unwrap_or(false);
        if inbound {
            PlayerState::PendingInboundRequest
        } else {
            PlayerState::Idle
        }
    }

    /// Ask `target` for consent to teleport `requester` to them. A newer
    /// request from the same requester replaces the older one.
    pub async fn request_teleport(
        &self,
        requester: &OnlinePlayer,
        target: &OnlinePlayer,
        now: i64,
    ) -> Result<TeleportRequest, TeleportError> {
        if requester.id == target.id {
            return Err(TeleportError::SelfRequest);
        }
        self.cooldowns.check(requester.id, now).await?;

        let request = TeleportRequest {
            requester: requester.id,
            requester_name: requester.name,
            target: target.id,
            created_at: now,
            expires_at: millis_after(now, self.settings.request_timeout),
        };

        match self.requests.entry_async(target.id).await {
            Entry::Occupied(mut occupied) => {
                let list = occupied.get_mut();
                list.retain(|r| !r.is_expired(now) && r.requester != requester.id);
                list.push(request.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(vec![request.clone()]);
            }
        }
        match self.outbound.entry_async(requester.id).await {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().insert(target.id);
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(HashSet::from([target.id]));
            }
        }

        debug!(
            requester = %requester.name,
            target = %target.name,
            expires_at = request.expires_at,
            "teleport request created"
        );
        Ok(request)
    }

    /// Consume the newest live request addressed to `target`.
    pub async fn accept_last_request(
        &self,
        target: Uuid,
        now: i64,
    ) -> Result<TeleportRequest, TeleportError> {
        self.take_request(target, now, |list| {
            list.iter()
                .enumerate()
                .max_by_key(|(_, r)| r.created_at)
                .map(|(idx, _)| idx)
        })
        .await
    }

    /// Consume the live request `requester_name` sent to `target`.
    pub async fn accept_request(
        &self,
        target: Uuid,
        requester_name: &str,
        now: i64,
    ) -> Result<TeleportRequest, TeleportError> {
        self.take_request(target, now, |list| {
            list.iter()
                .position(|r| r.requester_name.eq_ignore_ascii_case(requester_name))
        })
        .await
    }

    async fn take_request(
        &self,
        target: Uuid,
        now: i64,
        pick: impl FnOnce(&[TeleportRequest]) -> Option<usize>,
    ) -> Result<TeleportRequest, TeleportError> {
        let taken = self
            .requests
            .update_async(&target, |_, list| {
                list.retain(|r| !r.is_expired(now));
                pick(list.as_slice()).map(|idx| list.remove(idx))
            })
            .await
            .flatten();
        self.requests
            .remove_if_async(&target, |list| list.is_empty())
            .await;

        let request = taken.ok_or(TeleportError::NoPendingRequest)?;
        self.outbound
            .update_async(&request.requester, |_, targets| targets.remove(&target))
            .await;
        self.outbound
            .remove_if_async(&request.requester, |targets| targets.is_empty())
            .await;

        debug!(requester = %request.requester_name, %target, "teleport request accepted");
        Ok(request)
    }

    /// Accept a specific request and move its requester to `target`.
    pub async fn accept_and_teleport(
        &self,
        target: &OnlinePlayer,
        requester_name: &str,
        now: i64,
    ) -> Result<TeleportRequest, TeleportError> {
        let request = self.accept_request(target.id, requester_name, now).await?;
        self.teleport_requester(&request, target).await?;
        Ok(request)
    }

    /// Accept the newest request and move its requester to `target`.
    pub async fn accept_last_and_teleport(
        &self,
        target: &OnlinePlayer,
        now: i64,
    ) -> Result<TeleportRequest, TeleportError> {
        let request = self.accept_last_request(target.id, now).await?;
        self.teleport_requester(&request, target).await?;
        Ok(request)
    }

    async fn teleport_requester(
        &self,
        request: &TeleportRequest,
        target: &OnlinePlayer,
    ) -> Result<(), TeleportError> {
        let requester = self
            .proxy
            .player(request.requester)
            .ok_or_else(|| TeleportError::UnknownPlayer(request.requester_name.to_string()))?;
        self.teleport_to_player(&requester, target).await
    }

    /// Move `player` to wherever `target` stands right now.
    pub async fn teleport_to_player(
        &self,
        player: &OnlinePlayer,
        target: &OnlinePlayer,
    ) -> Result<(), TeleportError> {
        if player.server.eq_ignore_ascii_case(&target.server) {
            let frame = Message::TeleportToPlayer {
                player: player.name.to_string(),
                target: target.name.to_string(),
            }
            .encode()?;
            self.proxy.send_to_server(&target.server, frame).await?;
            debug!(player = %player.name, target = %target.name, server = %target.server, "teleport to player sent");
            return Ok(());
        }

        let location = self.query_location(target, &player.name).await?;
        self.teleport_to_location(player, &location).await
    }

    /// Move `player` to `location`, switching servers first if needed.
    pub async fn teleport_to_location(
        &self,
        player: &OnlinePlayer,
        location: &LocationInfo,
    ) -> Result<(), TeleportError> {
        if !player.server.eq_ignore_ascii_case(location.server()) {
            self.proxy.connect(player.id, location.server()).await?;
        }
        let frame = Message::TeleportToLocation {
            player: player.name.to_string(),
            position: Position::from(location),
        }
        .encode()?;
        self.proxy.send_to_server(location.server(), frame).await?;
        debug!(
            player = %player.name,
            server = %location.server(),
            world = %location.world(),
            "teleport to location sent"
        );
        Ok(())
    }

    /// Ask the backend hosting `target` where they stand.
    pub async fn query_location(
        &self,
        target: &OnlinePlayer,
        asked_by: &str,
    ) -> Result<LocationInfo, TeleportError> {
        let reason = format!("query-{}", self.next_query.fetch_add(1, Ordering::Relaxed));
        let key = (reason.clone(), asked_by.to_string());
        let (reply, rx) = oneshot::channel();
        let pending = PendingQuery {
            server: target.server.clone(),
            target: target.name,
            reply,
        };
        // keys are unique per query
        let _ = self.pending_locations.insert_async(key.clone(), pending).await;

        let frame = Message::GetLocation {
            reason,
            sender: asked_by.to_string(),
        }
        .encode()?;
        if let Err(err) = self.proxy.send_via_player(target.id, frame).await {
            self.pending_locations.remove_async(&key).await;
            return Err(err.into());
        }

        match tokio::time::timeout(self.settings.location_timeout, rx).await {
            Ok(Ok(location)) => Ok(location),
            // dropped by an unknown player error from the target's server
            Ok(Err(_)) => Err(TeleportError::UnknownPlayer(target.name.to_string())),
            Err(_) => {
                self.pending_locations.remove_async(&key).await;
                warn!(target = %target.name, server = %target.server, "location query timed out");
                Err(TeleportError::LocationTimeout(target.name.to_string()))
            }
        }
    }

    /// Drop the queries asking `server` about `player`, waking their waiters
    /// instead of letting them run into the timeout.
    async fn fail_location_queries(&self, server: &str, player: &str) {
        self.pending_locations
            .retain_async(|_, pending| {
                !(pending.server.eq_ignore_ascii_case(server)
                    && pending.target.eq_ignore_ascii_case(player))
            })
            .await;
    }

    /// Dispatch a frame a backend sent to the proxy.
    pub async fn handle_message(
        &self,
        from_server: &str,
        frame: &[u8],
        now: i64,
    ) -> Result<Inbound, TeleportError> {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(err) => return self.reject_frame(from_server, err).await,
        };

        match message {
            Message::PlayerLocation {
                reason,
                sender,
                position,
            } => {
                let key = (reason, sender);
                match self.pending_locations.remove_async(&key).await {
                    Some((_, pending)) => {
                        // the waiter may have timed out in between
                        let _ = pending.reply.send(position.on_server(from_server));
                        Ok(Inbound::LocationDelivered)
                    }
                    None => {
                        debug!(server = from_server, reason = %key.0, "unclaimed location reply");
                        Ok(Inbound::LocationUnclaimed)
                    }
                }
            }
            Message::Error { kind, detail } => {
                warn!(server = from_server, kind = kind.as_str(), %detail, "backend reported an error");
                if kind == ErrorKind::UnknownPlayer {
                    self.fail_location_queries(from_server, &detail).await;
                }
                Ok(Inbound::BackendError { kind, detail })
            }
            Message::TeleportToPlayer { player, target } => {
                let player = self.online(&player)?;
                let target = self.online(&target)?;
                self.teleport_to_player(&player, &target).await?;
                Ok(Inbound::Teleported)
            }
            Message::TeleportToLocation { player, position } => {
                let player = self.online(&player)?;
                self.teleport_to_location(&player, &position.on_server(from_server))
                    .await?;
                Ok(Inbound::Teleported)
            }
            Message::RunCommand(cmd) => self.handle_command(cmd, now).await,
            Message::GetLocation { .. } => {
                debug!(server = from_server, "ignoring get-location sent to the proxy");
                Ok(Inbound::Ignored(GET_LOCATION))
            }
        }
    }

    async fn reject_frame(
        &self,
        from_server: &str,
        err: ProtocolError,
    ) -> Result<Inbound, TeleportError> {
        let Some(channel) = err.channel() else {
            warn!(server = from_server, error = %err, "dropping undecodable frame");
            return Ok(Inbound::Dropped(err));
        };
        warn!(server = from_server, channel, error = %err, "bouncing malformed frame");
        let reply = Message::error(ErrorKind::MalformedMessage, channel).encode()?;
        self.proxy.send_to_server(from_server, reply).await?;
        Ok(Inbound::Bounced(err))
    }

    async fn handle_command(&self, cmd: RunCommand, now: i64) -> Result<Inbound, TeleportError> {
        if !cmd.is_player_sender() {
            return Ok(Inbound::Command(cmd));
        }
        let sender = self.online(&cmd.sender)?;

        if cmd.command.eq_ignore_ascii_case("tpaccept") {
            let request = match cmd.arg_list().first() {
                Some(requester) => self.accept_and_teleport(&sender, requester, now).await?,
                None => self.accept_last_and_teleport(&sender, now).await?,
            };
            return Ok(Inbound::Accepted(request));
        }

        if is_throttled(&cmd.command)
            && !self
                .permissions
                .has_permission(Subject::Player(sender.id), BYPASS_DELAY_PERMISSION)
        {
            self.cooldowns.try_use(sender.id, now).await?;
        }
        Ok(Inbound::Command(cmd))
    }

    /// Resolve a player name taken off the wire.
    fn online(&self, name: &str) -> Result<OnlinePlayer, TeleportError> {
        let unknown = || TeleportError::UnknownPlayer(name.to_string());
        let name = validate_player_name(name).map_err(|_| unknown())?;
        self.proxy.player_by_name(&name).ok_or_else(unknown)
    }

    /// Record where a player left from; forwarded to the owning cluster.
    pub async fn on_player_disconnect(&self, player: Uuid, server: &str) {
        self.registry
            .read()
            .await
            .on_player_disconnect(player, server)
            .await;
    }

    /// Send a player into a cluster, honouring logout affinity.
    pub async fn connect_to_cluster(
        &self,
        player: Uuid,
        cluster: &str,
    ) -> Result<String, TeleportError> {
        let server = self
            .registry
            .read()
            .await
            .connect_player(player, cluster, self.proxy.as_ref())
            .await?;
        info!(%player, cluster, %server, "player sent to cluster");
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AffinityStoreOpener;
    use crate::error::ServerUnavailable;
    use async_trait::async_trait;
    use serverclusters_db::{StorageError, ValueStorage};
    use std::sync::{Mutex, OnceLock, Weak};

    const T0: i64 = 1_700_000_000_000;

    struct NoStores;

    #[async_trait]
    impl AffinityStoreOpener for NoStores {
        async fn open_store(&self, _name: &str) -> Result<Arc<dyn ValueStorage>, StorageError> {
            Err(StorageError::Closed)
        }
    }

    struct Grants(Vec<&'static str>);

    impl PermissionCheck for Grants {
        fn has_permission(&self, _subject: Subject, permission: &str) -> bool {
            self.0.contains(&permission)
        }
    }

    /// Records frames and answers get-location queries for known players.
    #[derive(Default)]
    struct FakeProxy {
        players: Vec<OnlinePlayer>,
        locations: Vec<(Uuid, LocationInfo)>,
        sent: Mutex<Vec<(String, Message)>>,
        connects: Mutex<Vec<(Uuid, String)>>,
        coordinator: OnceLock<Weak<TeleportCoordinator>>,
    }

    impl FakeProxy {
        fn sent(&self) -> Vec<(String, Message)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProxyHost for FakeProxy {
        fn player(&self, id: Uuid) -> Option<OnlinePlayer> {
            self.players.iter().find(|p| p.id == id).cloned()
        }

        fn player_by_name(&self, name: &str) -> Option<OnlinePlayer> {
            self.players
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name))
                .cloned()
        }

        async fn connect(&self, player: Uuid, server: &str) -> Result<(), ServerUnavailable> {
            self.connects.lock().unwrap().push((player, server.to_string()));
            Ok(())
        }

        async fn send_to_server(&self, server: &str, frame: Vec<u8>) -> Result<(), ServerUnavailable> {
            let message = Message::decode(&frame).unwrap();
            self.sent.lock().unwrap().push((server.to_string(), message));
            Ok(())
        }

        async fn send_via_player(&self, player: Uuid, frame: Vec<u8>) -> Result<(), ServerUnavailable> {
            let online = self.player(player).ok_or(ServerUnavailable("none".into()))?;
            let message = Message::decode(&frame).unwrap();
            self.sent
                .lock()
                .unwrap()
                .push((online.server.clone(), message.clone()));

            let Message::GetLocation { reason, sender } = message else {
                return Ok(());
            };
            let Some((_, location)) = self.locations.iter().find(|(id, _)| *id == player) else {
                return Ok(());
            };
            let reply = Message::PlayerLocation {
                reason,
                sender,
                position: Position::from(location),
            }
            .encode()
            .unwrap();
            if let Some(coordinator) = self.coordinator.get().and_then(Weak::upgrade) {
                coordinator.handle_message(&online.server, &reply, T0).await.unwrap();
            }
            Ok(())
        }
    }

    fn online(name: &str, server: &str) -> OnlinePlayer {
        OnlinePlayer {
            id: Uuid::new_v4(),
            name: validate_player_name(name).unwrap(),
            server: server.to_string(),
        }
    }

    fn settings(delay_secs: u64) -> TeleportSettings {
        TeleportSettings {
            teleport_delay: Duration::from_secs(delay_secs),
            request_timeout: Duration::from_secs(120),
            location_timeout: Duration::from_millis(100),
        }
    }

    fn coordinator_with(proxy: Arc<FakeProxy>, permissions: Grants, delay_secs: u64) -> Arc<TeleportCoordinator> {
        let registry = Arc::new(RwLock::new(ClusterRegistry::empty(Arc::new(NoStores))));
        let coordinator = Arc::new(TeleportCoordinator::new(
            proxy.clone(),
            Arc::new(permissions),
            registry,
            settings(delay_secs),
        ));
        let _ = proxy.coordinator.set(Arc::downgrade(&coordinator));
        coordinator
    }

    fn coordinator(proxy: Arc<FakeProxy>) -> Arc<TeleportCoordinator> {
        coordinator_with(proxy, Grants(vec![]), 0)
    }

    #[tokio::test]
    async fn test_accept_succeeds_exactly_once() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let tc = coordinator(Arc::new(FakeProxy::default()));

        tc.request_teleport(&a, &b, T0).await.unwrap();
        let accepted = tc.accept_last_request(b.id, T0 + 1_000).await.unwrap();
        assert_eq!(accepted.requester, a.id);
        assert!(matches!(
            tc.accept_last_request(b.id, T0 + 2_000).await,
            Err(TeleportError::NoPendingRequest)
        ));
    }

    #[tokio::test]
    async fn test_huge_request_timeout_never_expires() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let registry = Arc::new(RwLock::new(ClusterRegistry::empty(Arc::new(NoStores))));
        let mut settings = settings(0);
        settings.request_timeout = Duration::from_secs(u64::MAX);
        let tc = TeleportCoordinator::new(
            Arc::new(FakeProxy::default()),
            Arc::new(Grants(vec![])),
            registry,
            settings,
        );

        tc.request_teleport(&a, &b, T0).await.unwrap();
        let request = tc.accept_last_request(b.id, i64::MAX - 1).await.unwrap();
        assert_eq!(request.expires_at, i64::MAX);
    }

    #[tokio::test]
    async fn test_latest_request_wins() {
        let (a, b, c) = (online("Alice", "s1"), online("Bob", "s1"), online("Carol", "s1"));
        let tc = coordinator(Arc::new(FakeProxy::default()));

        tc.request_teleport(&a, &b, T0).await.unwrap();
        tc.request_teleport(&c, &b, T0 + 10).await.unwrap();
        tc.request_teleport(&a, &b, T0 + 20).await.unwrap();

        let newest = tc.accept_last_request(b.id, T0 + 30).await.unwrap();
        assert_eq!(newest.requester, a.id);
        assert_eq!(newest.created_at, T0 + 20);
        // the superseded request from Alice is gone, Carol's remains
        let next = tc.accept_last_request(b.id, T0 + 30).await.unwrap();
        assert_eq!(next.requester, c.id);
        assert!(tc.accept_last_request(b.id, T0 + 30).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_by_name_is_case_insensitive() {
        let (a, b, c) = (online("Alice", "s1"), online("Bob", "s1"), online("Carol", "s1"));
        let tc = coordinator(Arc::new(FakeProxy::default()));

        tc.request_teleport(&a, &b, T0).await.unwrap();
        tc.request_teleport(&c, &b, T0 + 10).await.unwrap();

        assert!(matches!(
            tc.accept_request(b.id, "dave", T0).await,
            Err(TeleportError::NoPendingRequest)
        ));
        assert_eq!(tc.accept_request(b.id, "ALICE", T0).await.unwrap().requester, a.id);
        // Carol's request to Bob is unaffected
        assert_eq!(tc.accept_request(b.id, "carol", T0).await.unwrap().requester, c.id);
    }

    #[tokio::test]
    async fn test_expired_requests_cannot_be_accepted() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let tc = coordinator(Arc::new(FakeProxy::default()));

        tc.request_teleport(&a, &b, T0).await.unwrap();
        assert!(matches!(
            tc.accept_last_request(b.id, T0 + 120_000).await,
            Err(TeleportError::NoPendingRequest)
        ));
        assert_eq!(tc.player_state(b.id, T0 + 120_000).await, PlayerState::Idle);
    }

    #[tokio::test]
    async fn test_player_states() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let tc = coordinator_with(Arc::new(FakeProxy::default()), Grants(vec![]), 10);

        assert_eq!(tc.player_state(a.id, T0).await, PlayerState::Idle);
        tc.request_teleport(&a, &b, T0).await.unwrap();
        assert_eq!(tc.player_state(a.id, T0).await, PlayerState::PendingOutboundRequest);
        assert_eq!(tc.player_state(b.id, T0).await, PlayerState::PendingInboundRequest);

        tc.record_usage(a.id, T0).await;
        assert_eq!(
            tc.player_state(a.id, T0 + 4_000).await,
            PlayerState::Cooldown(Duration::from_secs(6))
        );

        tc.accept_last_request(b.id, T0).await.unwrap();
        assert_eq!(tc.player_state(a.id, T0 + 10_000).await, PlayerState::Idle);
        assert_eq!(tc.player_state(b.id, T0).await, PlayerState::Idle);
    }

    #[tokio::test]
    async fn test_cooldown_gates_requests() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let tc = coordinator_with(Arc::new(FakeProxy::default()), Grants(vec![]), 10);

        tc.record_usage(a.id, T0).await;
        match tc.request_teleport(&a, &b, T0 + 5_000).await {
            Err(TeleportError::CooldownActive(remaining)) => {
                assert_eq!(remaining, Duration::from_secs(5))
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert!(tc.request_teleport(&a, &b, T0 + 11_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_self_request_rejected() {
        let a = online("Alice", "s1");
        let tc = coordinator(Arc::new(FakeProxy::default()));
        assert!(matches!(
            tc.request_teleport(&a, &a, T0).await,
            Err(TeleportError::SelfRequest)
        ));
    }

    #[tokio::test]
    async fn test_same_server_teleport_sends_tptoplayer() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone(), b.clone()],
            ..Default::default()
        });
        let tc = coordinator(proxy.clone());

        tc.request_teleport(&a, &b, T0).await.unwrap();
        tc.accept_last_and_teleport(&b, T0).await.unwrap();

        assert_eq!(
            proxy.sent(),
            vec![(
                "s1".to_string(),
                Message::TeleportToPlayer {
                    player: "Alice".into(),
                    target: "Bob".into()
                }
            )]
        );
        assert!(proxy.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_server_teleport_queries_location() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s2"));
        let bob_at = LocationInfo::with_rotation("s2", "world", 10.5, 70.0, -3.0, 90.0, 0.0);
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone(), b.clone()],
            locations: vec![(b.id, bob_at.clone())],
            ..Default::default()
        });
        let tc = coordinator(proxy.clone());

        tc.request_teleport(&a, &b, T0).await.unwrap();
        tc.accept_and_teleport(&b, "alice", T0).await.unwrap();

        assert_eq!(*proxy.connects.lock().unwrap(), vec![(a.id, "s2".to_string())]);
        let sent = proxy.sent();
        assert!(matches!(&sent[0].1, Message::GetLocation { sender, .. } if sender == "Alice"));
        assert_eq!(
            sent[1],
            (
                "s2".to_string(),
                Message::TeleportToLocation {
                    player: "Alice".into(),
                    position: Position::from(&bob_at),
                }
            )
        );
    }

    #[tokio::test]
    async fn test_location_query_times_out() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s2"));
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone(), b.clone()],
            ..Default::default()
        });
        let tc = coordinator(proxy.clone());

        assert!(matches!(
            tc.teleport_to_player(&a, &b).await,
            Err(TeleportError::LocationTimeout(name)) if name == "Bob"
        ));
        assert!(proxy.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_player_error_fails_location_query() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s2"));
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone(), b.clone()],
            ..Default::default()
        });
        let tc = coordinator(proxy.clone());

        let query = {
            let (tc, b) = (tc.clone(), b.clone());
            tokio::spawn(async move { tc.query_location(&b, "Alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // an error about someone else, or from another server, leaves it pending
        let other = Message::error(ErrorKind::UnknownPlayer, "Bob").encode().unwrap();
        tc.handle_message("s3", &other, T0).await.unwrap();
        let other = Message::error(ErrorKind::UnknownPlayer, "Carol").encode().unwrap();
        tc.handle_message("s2", &other, T0).await.unwrap();
        assert_eq!(tc.pending_locations.len(), 1);

        let frame = Message::error(ErrorKind::UnknownPlayer, "bob").encode().unwrap();
        assert!(matches!(
            tc.handle_message("s2", &frame, T0).await.unwrap(),
            Inbound::BackendError { kind: ErrorKind::UnknownPlayer, .. }
        ));
        assert!(matches!(
            query.await.unwrap(),
            Err(TeleportError::UnknownPlayer(name)) if name == "Bob"
        ));
        assert!(tc.pending_locations.is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_location_reply() {
        let tc = coordinator(Arc::new(FakeProxy::default()));
        let frame = Message::PlayerLocation {
            reason: "query-99".into(),
            sender: "Alice".into(),
            position: Position::from(&LocationInfo::new("s1", "world", 0.0, 0.0, 0.0)),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            tc.handle_message("s1", &frame, T0).await.unwrap(),
            Inbound::LocationUnclaimed
        ));
    }

    #[tokio::test]
    async fn test_malformed_frames_bounce_or_drop() {
        let proxy = Arc::new(FakeProxy::default());
        let tc = coordinator(proxy.clone());

        let mut truncated = Message::GetLocation {
            reason: "r".into(),
            sender: "s".into(),
        }
        .encode()
        .unwrap();
        truncated.pop();
        assert!(matches!(
            tc.handle_message("s1", &truncated, T0).await.unwrap(),
            Inbound::Bounced(_)
        ));
        assert_eq!(
            proxy.sent(),
            vec![(
                "s1".to_string(),
                Message::error(ErrorKind::MalformedMessage, GET_LOCATION)
            )]
        );

        assert!(matches!(
            tc.handle_message("s1", &[0, 3, b'a', b'b', b'c'], T0).await.unwrap(),
            Inbound::Dropped(ProtocolError::UnknownChannel(_))
        ));
        assert_eq!(proxy.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_is_returned() {
        let tc = coordinator(Arc::new(FakeProxy::default()));
        let frame = Message::error(ErrorKind::UnknownWorld, "nonexistent").encode().unwrap();
        match tc.handle_message("s1", &frame, T0).await.unwrap() {
            Inbound::BackendError { kind, detail } => {
                assert_eq!(kind, ErrorKind::UnknownWorld);
                assert_eq!(detail, "nonexistent");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn command(sender: &str, command: &str, args: &str) -> Vec<u8> {
        Message::RunCommand(RunCommand {
            sender: sender.into(),
            command: command.into(),
            location: Some(Position::from(&LocationInfo::new("s1", "world", 0.0, 64.0, 0.0))),
            args: args.into(),
        })
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_forwarded_tpaccept_is_executed() {
        let (a, b) = (online("Alice", "s1"), online("Bob", "s1"));
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone(), b.clone()],
            ..Default::default()
        });
        let tc = coordinator(proxy.clone());

        tc.request_teleport(&a, &b, T0).await.unwrap();
        match tc.handle_message("s1", &command("Bob", "tpaccept", "alice"), T0).await.unwrap() {
            Inbound::Accepted(request) => assert_eq!(request.requester, a.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            tc.handle_message("s1", &command("Bob", "tpaccept", ""), T0).await,
            Err(TeleportError::NoPendingRequest)
        ));
    }

    #[tokio::test]
    async fn test_forwarded_warp_is_throttled() {
        let a = online("Alice", "s1");
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone()],
            ..Default::default()
        });
        let tc = coordinator_with(proxy, Grants(vec![]), 10);

        assert!(matches!(
            tc.handle_message("s1", &command("Alice", "warp", "market"), T0).await.unwrap(),
            Inbound::Command(cmd) if cmd.arg_list() == ["market"]
        ));
        assert!(matches!(
            tc.handle_message("s1", &command("Alice", "spawn", ""), T0 + 5_000).await,
            Err(TeleportError::CooldownActive(_))
        ));
        // not throttled
        assert!(tc.handle_message("s1", &command("Alice", "list", ""), T0 + 5_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_bypass_permission_skips_cooldown() {
        let a = online("Alice", "s1");
        let proxy = Arc::new(FakeProxy {
            players: vec![a.clone()],
            ..Default::default()
        });
        let tc = coordinator_with(proxy, Grants(vec![BYPASS_DELAY_PERMISSION]), 10);

        for _ in 0..3 {
            assert!(tc.handle_message("s1", &command("Alice", "warp", "x"), T0).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_to_one_target() {
        let target = online("Bob", "s1");
        let tc = coordinator(Arc::new(FakeProxy::default()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let tc = tc.clone();
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                let requester = online(&format!("Player{i}"), "s1");
                tc.request_teleport(&requester, &target, T0 + i).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut accepted = 0;
        while tc.accept_last_request(target.id, T0 + 100).await.is_ok() {
            accepted += 1;
        }
        assert_eq!(accepted, 8);
    }
}
