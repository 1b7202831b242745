//! Binary messages exchanged between the proxy and backend servers.
//!
//! A frame is the channel name followed by the payload fields of that
//! channel, in a fixed order. Strings carry a 2-byte big-endian length
//! prefix, floating point values are big-endian IEEE-754 and booleans are a
//! single byte.

use crate::location::LocationInfo;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};
use thiserror::Error;

pub const TELEPORT_TO_PLAYER: &str = "sc:tptoplayer";
pub const TELEPORT_TO_LOCATION: &str = "sc:tptolocation";
pub const GET_LOCATION: &str = "sc:getlocation";
pub const PLAYER_LOCATION: &str = "sc:playerlocation";
pub const ERROR: &str = "sc:error";
pub const RUN_COMMAND: &str = "sc:runcommand";

pub const CHANNELS: [&str; 6] = [
    TELEPORT_TO_PLAYER,
    TELEPORT_TO_LOCATION,
    GET_LOCATION,
    PLAYER_LOCATION,
    ERROR,
    RUN_COMMAND,
];

/// Sender name backends use when a command comes from the console.
pub const CONSOLE_SENDER: &str = "[@]";

const MAX_STRING_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short to hold a channel name")]
    MissingChannel,

    #[error("channel name is not valid utf-8")]
    InvalidChannel,

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("truncated payload on channel '{channel}'")]
    Truncated { channel: &'static str },

    #[error("invalid utf-8 string on channel '{channel}'")]
    InvalidString { channel: &'static str },

    #[error("{count} unexpected trailing bytes on channel '{channel}'")]
    TrailingBytes { channel: &'static str, count: usize },

    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),

    #[error("io error while encoding: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// The channel of a malformed message, if the frame got that far.
    ///
    /// Only these can be answered with an error message; the rest are dropped.
    pub fn channel(&self) -> Option<&'static str> {
        match self {
            ProtocolError::Truncated { channel }
            | ProtocolError::InvalidString { channel }
            | ProtocolError::TrailingBytes { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

/// Kind field of an error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownWorld,
    UnknownPlayer,
    MalformedMessage,
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::UnknownWorld => "unknown world",
            ErrorKind::UnknownPlayer => "unknown player",
            ErrorKind::MalformedMessage => "malformed message",
            ErrorKind::Other(kind) => kind,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "unknown world" => ErrorKind::UnknownWorld,
            "unknown player" => ErrorKind::UnknownPlayer,
            "malformed message" => ErrorKind::MalformedMessage,
            _ => ErrorKind::Other(kind),
        }
    }
}

/// World and coordinates without a server; the server is implied by the
/// connection a message travels on.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
}

impl Position {
    pub fn on_server(&self, server: impl Into<String>) -> LocationInfo {
        LocationInfo::with_rotation(
            server,
            self.world.clone(),
            self.x,
            self.y,
            self.z,
            self.yaw,
            self.pitch,
        )
    }
}

impl From<&LocationInfo> for Position {
    fn from(loc: &LocationInfo) -> Self {
        Self {
            world: loc.world().to_string(),
            x: loc.x(),
            y: loc.y(),
            z: loc.z(),
            yaw: loc.yaw(),
            pitch: loc.pitch(),
        }
    }
}

/// A command a backend forwards to the proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCommand {
    /// Display name of the sender, [`CONSOLE_SENDER`] for the console.
    pub sender: String,
    pub command: String,
    /// Where the sender stands; `None` when it is not a player.
    pub location: Option<Position>,
    /// Arguments joined by single spaces.
    pub args: String,
}

impl RunCommand {
    pub fn is_player_sender(&self) -> bool {
        self.location.is_some()
    }

    pub fn arg_list(&self) -> Vec<&str> {
        self.args.split_whitespace().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    TeleportToPlayer {
        player: String,
        target: String,
    },
    TeleportToLocation {
        player: String,
        position: Position,
    },
    GetLocation {
        reason: String,
        sender: String,
    },
    PlayerLocation {
        reason: String,
        sender: String,
        position: Position,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
    RunCommand(RunCommand),
}

impl Message {
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Message::Error {
            kind,
            detail: detail.into(),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Message::TeleportToPlayer { .. } => TELEPORT_TO_PLAYER,
            Message::TeleportToLocation { .. } => TELEPORT_TO_LOCATION,
            Message::GetLocation { .. } => GET_LOCATION,
            Message::PlayerLocation { .. } => PLAYER_LOCATION,
            Message::Error { .. } => ERROR,
            Message::RunCommand(_) => RUN_COMMAND,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(64);
        write_string(&mut out, self.channel())?;
        match self {
            Message::TeleportToPlayer { player, target } => {
                write_string(&mut out, player)?;
                write_string(&mut out, target)?;
            }
            Message::TeleportToLocation { player, position } => {
                write_string(&mut out, player)?;
                write_position(&mut out, position)?;
            }
            Message::GetLocation { reason, sender } => {
                write_string(&mut out, reason)?;
                write_string(&mut out, sender)?;
            }
            Message::PlayerLocation {
                reason,
                sender,
                position,
            } => {
                write_string(&mut out, reason)?;
                write_string(&mut out, sender)?;
                write_position(&mut out, position)?;
            }
            Message::Error { kind, detail } => {
                write_string(&mut out, kind.as_str())?;
                write_string(&mut out, detail)?;
            }
            Message::RunCommand(cmd) => {
                write_string(&mut out, &cmd.sender)?;
                write_string(&mut out, &cmd.command)?;
                out.write_u8(cmd.location.is_some() as u8)?;
                if let Some(position) = &cmd.location {
                    write_position(&mut out, position)?;
                }
                write_string(&mut out, &cmd.args)?;
            }
        }
        Ok(out)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(frame);
        let channel = read_channel(&mut cursor)?;
        let mut reader = PayloadReader { cursor, channel };

        let message = match channel {
            TELEPORT_TO_PLAYER => Message::TeleportToPlayer {
                player: reader.string()?,
                target: reader.string()?,
            },
            TELEPORT_TO_LOCATION => Message::TeleportToLocation {
                player: reader.string()?,
                position: reader.position()?,
            },
            GET_LOCATION => Message::GetLocation {
                reason: reader.string()?,
                sender: reader.string()?,
            },
            PLAYER_LOCATION => Message::PlayerLocation {
                reason: reader.string()?,
                sender: reader.string()?,
                position: reader.position()?,
            },
            ERROR => Message::Error {
                kind: ErrorKind::from(reader.string()?),
                detail: reader.string()?,
            },
            // RUN_COMMAND; read_channel only yields known channels
            _ => {
                let sender = reader.string()?;
                let command = reader.string()?;
                let location = if reader.bool()? {
                    Some(reader.position()?)
                } else {
                    None
                };
                Message::RunCommand(RunCommand {
                    sender,
                    command,
                    location,
                    args: reader.string()?,
                })
            }
        };

        reader.finish()?;
        Ok(message)
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(value.len()));
    }
    out.write_u16::<BigEndian>(value.len() as u16)?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_position(out: &mut Vec<u8>, position: &Position) -> Result<(), ProtocolError> {
    write_string(out, &position.world)?;
    out.write_f64::<BigEndian>(position.x)?;
    out.write_f64::<BigEndian>(position.y)?;
    out.write_f64::<BigEndian>(position.z)?;
    out.write_f32::<BigEndian>(position.yaw)?;
    out.write_f32::<BigEndian>(position.pitch)?;
    Ok(())
}

/// Reads the channel name and maps it onto one of the known channel constants.
fn read_channel(cursor: &mut Cursor<&[u8]>) -> Result<&'static str, ProtocolError> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| ProtocolError::MissingChannel)? as usize;
    let mut bytes = vec![0; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| ProtocolError::MissingChannel)?;
    let name = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidChannel)?;

    CHANNELS
        .into_iter()
        .find(|channel| *channel == name)
        .ok_or(ProtocolError::UnknownChannel(name))
}

struct PayloadReader<'a> {
    cursor: Cursor<&'a [u8]>,
    channel: &'static str,
}

impl PayloadReader<'_> {
    fn truncated(&self) -> ProtocolError {
        ProtocolError::Truncated {
            channel: self.channel,
        }
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self
            .cursor
            .read_u16::<BigEndian>()
            .map_err(|_| self.truncated())? as usize;
        let mut bytes = vec![0; len];
        self.cursor
            .read_exact(&mut bytes)
            .map_err(|_| self.truncated())?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString {
            channel: self.channel,
        })
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        self.cursor
            .read_f64::<BigEndian>()
            .map_err(|_| self.truncated())
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        self.cursor
            .read_f32::<BigEndian>()
            .map_err(|_| self.truncated())
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        self.cursor
            .read_u8()
            .map(|b| b != 0)
            .map_err(|_| self.truncated())
    }

    fn position(&mut self) -> Result<Position, ProtocolError> {
        Ok(Position {
            world: self.string()?,
            x: self.f64()?,
            y: self.f64()?,
            z: self.f64()?,
            yaw: self.f32()?,
            pitch: self.f32()?,
        })
    }

    fn finish(self) -> Result<(), ProtocolError> {
        let total = self.cursor.get_ref().len();
        let read = self.cursor.position() as usize;
        if read < total {
            return Err(ProtocolError::TrailingBytes {
                channel: self.channel,
                count: total - read,
            });
        }
        Ok(())
    }
}
