//! Liveness monitor: evicts players whose heartbeat went stale

use tracing::{info, warn};

use crate::config::Config;
use crate::util::time::{as_millis, Millis};
use crate::ws::protocol::{PlayerId, ServerMsg};

use super::players::{Outbound, Player};
use super::server::ServerState;

/// Eviction thresholds
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub heartbeat_timeout_ms: Millis,
    /// Unfocused for longer than this gets kicked too (off when `None`)
    pub inactive_kick_ms: Option<Millis>,
}

impl LivenessPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout_ms: as_millis(config.heartbeat_timeout),
            inactive_kick_ms: config.inactive_kick.map(as_millis),
        }
    }

    pub fn is_stale(&self, player: &Player, now: Millis) -> bool {
        if now.saturating_sub(player.last_heartbeat) > self.heartbeat_timeout_ms {
            return true;
        }
        match (self.inactive_kick_ms, player.inactive_since) {
            (Some(limit), Some(since)) => player.inactive && now.saturating_sub(since) > limit,
            _ => false,
        }
    }
}

impl ServerState {
    /// One sweep: kick every stale player. Returns the evicted ids.
    pub fn sweep(&mut self, now: Millis) -> Vec<PlayerId> {
        let stale: Vec<PlayerId> = self
            .connections
            .players()
            .filter(|p| self.liveness.is_stale(p, now))
            .map(|p| p.id)
            .collect();

        for id in &stale {
            self.kick(id, now);
        }
        stale
    }

    /// Notify, close and forget a connection
    pub fn kick(&mut self, id: &PlayerId, now: Millis) {
        if let Some(player) = self.connections.get(id) {
            warn!(
                player_id = %id,
                room_id = %player.room_id,
                silent_ms = now.saturating_sub(player.last_heartbeat),
                "Kicking unresponsive player"
            );
        }

        self.send_to(id, &ServerMsg::Kicked);
        self.connections.send(id, Outbound::Close);
        self.disconnect(id, now);
        info!(player_id = %id, "Connection evicted");
    }
}
