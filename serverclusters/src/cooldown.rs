use crate::error::TeleportError;
use crate::helpers::{millis_after, remaining_until};

use scc::hash_map::Entry;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Last use of a throttled command (warp, spawn) per player.
///
/// Records are overwritten on every use and never removed; an old record
/// simply no longer blocks anything.
pub struct CooldownTracker {
    delay: Duration,
    last_use: scc::HashMap<Uuid, i64>,
}

impl CooldownTracker {
    /// A zero delay disables the cooldown.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_use: scc::HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero()
    }

    pub async fn record_usage(&self, player: Uuid, now: i64) {
        match self.last_use.entry_async(player).await {
            Entry::Occupied(mut occupied) => *occupied.get_mut() = now,
            Entry::Vacant(vacant) => {
                vacant.insert_entry(now);
            }
        }
        debug!(%player, now, "recorded throttled command use");
    }

    /// Time the player still has to wait, zero if nothing blocks them.
    pub async fn remaining(&self, player: Uuid, now: i64) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        self.last_use
            .read_async(&player, |_, &last| {
                remaining_until(millis_after(last, self.delay), now)
            })
            .await
            .unwrap_or(Duration::ZERO)
    }

    pub async fn check(&self, player: Uuid, now: i64) -> Result<(), TeleportError> {
        let remaining = self.remaining(player, now).await;
        if remaining.is_zero() {
            Ok(())
        } else {
            Err(TeleportError::CooldownActive(remaining))
        }
    }

    /// Check and, if allowed, record a new use in one step.
    pub async fn try_use(&self, player: Uuid, now: i64) -> Result<(), TeleportError> {
        if !self.is_enabled() {
            return Ok(());
        }
        match self.last_use.entry_async(player).await {
            Entry::Occupied(mut occupied) => {
                let remaining = remaining_until(millis_after(*occupied.get(), self.delay), now);
                if !remaining.is_zero() {
                    return Err(TeleportError::CooldownActive(remaining));
                }
                *occupied.get_mut() = now;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(now);
            }
        }
        Ok(())
    }
}
