/// Validation for names that arrive from configuration or over the wire
use arrayvec::ArrayString;
use thiserror::Error;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Player name cannot be empty")]
    PlayerNameEmpty,

    #[error("Player name too long (max 16 characters, got {0})")]
    PlayerNameTooLong(usize),

    #[error("Player name contains invalid characters (only alphanumeric and underscore allowed)")]
    PlayerNameInvalidChars,

    #[error("Cluster name cannot be empty")]
    ClusterNameEmpty,

    #[error("Cluster name '{0}' contains invalid characters (only alphanumeric, '-' and '_' allowed)")]
    ClusterNameInvalidChars(String),

    #[error("Cluster '{0}' has no servers")]
    ClusterWithoutServers(String),

    #[error("Server name cannot be empty")]
    ServerNameEmpty,

    #[error("Warp name cannot be empty")]
    WarpNameEmpty,
}

/// Validates a Minecraft player name
///
/// Rules:
/// - Cannot be empty
/// - Max 16 characters (Minecraft username limit)
/// - Only alphanumeric characters and underscores
pub fn validate_player_name(name: &str) -> Result<PlayerName, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::PlayerNameEmpty);
    }

    if name.len() > 16 {
        return Err(ValidationError::PlayerNameTooLong(name.len()));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::PlayerNameInvalidChars);
    }

    PlayerName::from(name).map_err(|_| ValidationError::PlayerNameTooLong(name.len()))
}

/// Validates a cluster name
///
/// Cluster names become part of storage table names, so they are restricted
/// to ascii alphanumerics, '-' and '_'.
pub fn validate_cluster_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::ClusterNameEmpty);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::ClusterNameInvalidChars(name.to_string()));
    }

    Ok(())
}

pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::ServerNameEmpty);
    }
    Ok(())
}

pub fn validate_warp_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::WarpNameEmpty);
    }
    Ok(())
}
