//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque per-connection player identifier
pub type PlayerId = Uuid;

/// World position `[x, y, z]`
pub type Position = [f64; 3];

/// Vehicle variant selected by the client.
///
/// Browsers send it as a number, the server always relays it as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCarModel", into = "String")]
pub struct CarModel(String);

impl CarModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self(model.into())
    }
}

impl Default for CarModel {
    fn default() -> Self {
        Self::new("1")
    }
}

impl fmt::Display for CarModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CarModel> for String {
    fn from(model: CarModel) -> Self {
        model.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCarModel {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<RawCarModel> for CarModel {
    fn from(raw: RawCarModel) -> Self {
        match raw {
            RawCarModel::Integer(n) => Self(n.to_string()),
            RawCarModel::Float(n) => Self(n.to_string()),
            RawCarModel::Text(s) => Self(s),
        }
    }
}

fn focused_default() -> bool {
    true
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMsg {
    /// Enter a room (the default room when none is given)
    #[serde(rename_all = "camelCase")]
    Join {
        player_name: String,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        car_model: CarModel,
    },

    /// Locally simulated vehicle pose
    #[serde(rename_all = "camelCase")]
    UpdatePosition {
        position: Position,
        rotation: f64,
        #[serde(default)]
        car_model: CarModel,
    },

    /// Vehicle left the platform
    PlayerFell,

    /// Vehicle placed back on the platform
    #[serde(rename_all = "camelCase")]
    Respawn {
        position: Position,
        rotation: f64,
        #[serde(default)]
        car_model: CarModel,
    },

    /// Keep-alive with the tab focus state
    Heartbeat {
        #[serde(default = "focused_default")]
        focused: bool,
    },

    /// Tab lost focus
    Inactive,

    /// Latency probe
    Ping,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMsg {
    /// Confirmation of a JOIN with the current round snapshot
    #[serde(rename_all = "camelCase")]
    JoinSuccess {
        player_id: PlayerId,
        platform_size: f64,
        is_waiting_for_round: bool,
        round_number: u64,
    },

    /// Everyone else already in the room at join time
    ExistingPlayers { players: Vec<PlayerInfo> },

    /// Player joined the room
    PlayerJoined { player: PlayerInfo },

    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        player_id: PlayerId,
        position: Position,
        rotation: f64,
        car_model: CarModel,
    },

    #[serde(rename_all = "camelCase")]
    PlayerFell {
        player_id: PlayerId,
        /// Milliseconds survived in the current round
        survival_time: u64,
    },

    #[serde(rename_all = "camelCase")]
    PlayerRespawn {
        player_id: PlayerId,
        position: Position,
        rotation: f64,
        car_model: CarModel,
    },

    #[serde(rename_all = "camelCase")]
    PlayerLeft { player_id: PlayerId },

    /// Countdown to the next round
    #[serde(rename_all = "camelCase")]
    WaitingNewRound { countdown: u64, round_number: u64 },

    #[serde(rename_all = "camelCase")]
    NewRoundStarted { platform_size: f64, round_number: u64 },

    #[serde(rename_all = "camelCase")]
    PlatformUpdate { platform_size: f64, round_number: u64 },

    #[serde(rename_all = "camelCase")]
    RoundEnded { round_number: u64 },

    /// Connection is about to be closed by the server
    Kicked,

    /// Answer to PING and HEARTBEAT
    Pong,
}

/// Public view of a player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    pub position: Position,
    pub rotation: f64,
    pub car_model: CarModel,
    pub falling: bool,
    pub survival_time: u64,
    pub is_waiting_for_round: bool,
}
