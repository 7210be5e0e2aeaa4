//! Connection registry: live connections and the players bound to them

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::util::time::Millis;
use crate::ws::protocol::{CarModel, PlayerId, PlayerInfo, Position};

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized server message
    Frame(String),
    /// Close the socket after flushing earlier frames
    Close,
}

/// Sending half of a connection's outbox
pub type Outbox = mpsc::Sender<Outbound>;

/// Spawn point for a freshly joined player
pub const JOIN_POSITION: Position = [0.0, 1.0, 0.0];

/// Player state (authoritative record, one per joined connection)
#[derive(Debug, Clone)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub room_id: String,

    // Pose as last reported by the client
    pub position: Position,
    pub rotation: f64,
    pub car_model: CarModel,

    // Round participation
    pub falling: bool,
    pub is_waiting_for_round: bool,
    pub survival_time: u64,
    /// When the player entered the current round (or the server)
    pub join_time: Millis,

    // Liveness
    pub last_heartbeat: Millis,
    pub inactive: bool,
    pub inactive_since: Option<Millis>,
}

impl Player {
    pub fn new(
        id: PlayerId,
        name: String,
        car_model: CarModel,
        room_id: String,
        now: Millis,
    ) -> Self {
        Self {
            id,
            name,
            room_id,
            position: JOIN_POSITION,
            rotation: 0.0,
            car_model,
            falling: false,
            is_waiting_for_round: true,
            survival_time: 0,
            join_time: now,
            last_heartbeat: now,
            inactive: false,
            inactive_since: None,
        }
    }

    /// Still standing on the platform in the running round
    pub fn is_alive_in_round(&self) -> bool {
        !self.falling && !self.is_waiting_for_round
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            name: self.name.clone(),
            position: self.position,
            rotation: self.rotation,
            car_model: self.car_model.clone(),
            falling: self.falling,
            survival_time: self.survival_time,
            is_waiting_for_round: self.is_waiting_for_round,
        }
    }
}

/// Maps connections to their outboxes and joined players to their records.
///
/// A connection exists from socket open until close; a player exists only
/// between a successful JOIN and the disconnect.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PlayerId, Outbox>,
    players: HashMap<PlayerId, Player>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection
    pub fn open(&mut self, id: PlayerId, outbox: Outbox) {
        self.connections.insert(id, outbox);
    }

    pub fn is_open(&self, id: &PlayerId) -> bool {
        self.connections.contains_key(id)
    }

    /// Forget a connection's outbox; the player record is removed separately
    pub fn close(&mut self, id: &PlayerId) -> Option<Outbox> {
        self.connections.remove(id)
    }

    /// Create the player record for an open connection
    pub fn register(
        &mut self,
        id: PlayerId,
        name: String,
        car_model: CarModel,
        room_id: String,
        now: Millis,
    ) -> Option<&Player> {
        if !self.connections.contains_key(&id) {
            return None;
        }
        let player = Player::new(id, name, car_model, room_id, now);
        self.players.insert(id, player);
        self.players.get(&id)
    }

    pub fn get(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn get_mut(&mut self, id: &PlayerId) -> Option<&mut Player> {
        self.players.get_mut(id)
    }

    pub fn remove(&mut self, id: &PlayerId) -> Option<Player> {
        self.players.remove(id)
    }

    /// Refresh the heartbeat and follow the reported focus state.
    /// Returns false for an unknown player.
    pub fn touch_heartbeat(&mut self, id: &PlayerId, focused: bool, now: Millis) -> bool {
        let Some(player) = self.players.get_mut(id) else {
            return false;
        };
        player.last_heartbeat = now;
        if !focused && !player.inactive {
            player.inactive = true;
            player.inactive_since = Some(now);
        } else if focused && player.inactive {
            player.inactive = false;
            player.inactive_since = None;
        }
        true
    }

    /// Flag a player as unfocused without touching its heartbeat
    pub fn mark_inactive(&mut self, id: &PlayerId, now: Millis) -> bool {
        let Some(player) = self.players.get_mut(id) else {
            return false;
        };
        if !player.inactive {
            player.inactive = true;
            player.inactive_since = Some(now);
        }
        true
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Mutable records of every player whose id passes `is_member`
    pub fn members_mut<F>(&mut self, is_member: F) -> Vec<&mut Player>
    where
        F: Fn(&PlayerId) -> bool,
    {
        self.players
            .values_mut()
            .filter(|p| is_member(&p.id))
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a frame without waiting; closed or saturated outboxes are skipped
    pub fn send(&self, id: &PlayerId, outbound: Outbound) -> bool {
        let Some(outbox) = self.connections.get(id) else {
            return false;
        };
        match outbox.try_send(outbound) {
            Ok(()) => true,
            Err(e) => {
                debug!(player_id = %id, error = %e, "Skipping send to unavailable connection");
                false
            }
        }
    }
}
