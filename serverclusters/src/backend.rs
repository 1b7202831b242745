use crate::capabilities::{BYPASS_DELAY_PERMISSION, PermissionCheck, Subject, WorldHost};
use crate::cooldown::CooldownTracker;
use crate::error::TeleportError;
use crate::protocol::{CONSOLE_SENDER, ErrorKind, Message, Position, RunCommand};
use crate::teleport::is_throttled;

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Who runs a command on a backend server.
#[derive(Debug, Clone, Copy)]
pub enum CommandSender<'a> {
    Console,
    Player { id: Uuid, name: &'a str },
}

/// Backend-side handler for frames the proxy sends, and builder of the
/// commands a backend forwards to the proxy.
pub struct BackendListener {
    server: String,
    world: Arc<dyn WorldHost>,
    permissions: Arc<dyn PermissionCheck>,
    cooldowns: Arc<CooldownTracker>,
}

impl BackendListener {
    pub fn new(
        server: impl Into<String>,
        world: Arc<dyn WorldHost>,
        permissions: Arc<dyn PermissionCheck>,
        cooldowns: Arc<CooldownTracker>,
    ) -> Self {
        Self {
            server: server.into(),
            world,
            permissions,
            cooldowns,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Handle a frame delivered over `receiver`'s connection and return the
    /// reply for the proxy, if any.
    pub async fn handle_message(&self, receiver: &str, frame: &[u8]) -> Option<Message> {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(server = %self.server, error = %err, "malformed frame from proxy");
                return err
                    .channel()
                    .map(|channel| Message::error(ErrorKind::MalformedMessage, channel));
            }
        };

        match message {
            Message::TeleportToPlayer { player, target } => {
                if self.world.teleport_to_player(&player, &target).await {
                    debug!(%player, %target, "teleported to player");
                    return None;
                }
                let missing = if self.world.location_of(&player).is_none() {
                    player
                } else {
                    target
                };
                Some(Message::error(ErrorKind::UnknownPlayer, missing))
            }
            Message::TeleportToLocation { player, position } => {
                if !self.world.has_world(&position.world) {
                    return Some(Message::error(ErrorKind::UnknownWorld, position.world));
                }
                let location = position.on_server(self.server.as_str());
                if self.world.teleport_to_location(&player, &location).await {
                    debug!(%player, world = %location.world(), "teleported to location");
                    None
                } else {
                    Some(Message::error(ErrorKind::UnknownPlayer, player))
                }
            }
            Message::GetLocation { reason, sender } => match self.world.location_of(receiver) {
                Some(location) => Some(Message::PlayerLocation {
                    reason,
                    sender,
                    position: Position::from(&location),
                }),
                None => Some(Message::error(ErrorKind::UnknownPlayer, receiver)),
            },
            Message::Error { kind, detail } => {
                warn!(server = %self.server, kind = kind.as_str(), %detail, "proxy reported an error");
                None
            }
            other => {
                debug!(server = %self.server, channel = other.channel(), "ignoring frame meant for the proxy");
                None
            }
        }
    }

    /// Build the frame forwarding a command to the proxy. Throttled commands
    /// from players without the bypass permission start their cooldown here.
    pub async fn command_frame(
        &self,
        sender: CommandSender<'_>,
        command: &str,
        args: &[&str],
        now: i64,
    ) -> Result<Vec<u8>, TeleportError> {
        let (name, location) = match sender {
            CommandSender::Console => (CONSOLE_SENDER, None),
            CommandSender::Player { id, name } => {
                if is_throttled(command)
                    && !self
                        .permissions
                        .has_permission(Subject::Player(id), BYPASS_DELAY_PERMISSION)
                {
                    self.cooldowns.try_use(id, now).await?;
                }
                let location = self.world.location_of(name).map(|l| Position::from(&l));
                (name, location)
            }
        };

        let frame = Message::RunCommand(RunCommand {
            sender: name.to_string(),
            command: command.to_string(),
            location,
            args: args.join(" "),
        })
        .encode()?;
        Ok(frame)
    }
}
