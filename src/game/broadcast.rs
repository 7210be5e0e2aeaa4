//! Room-scoped fan-out

use tracing::error;

use crate::ws::protocol::{PlayerId, ServerMsg};

use super::players::Outbound;
use super::server::ServerState;

fn encode(msg: &ServerMsg) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(text),
        Err(e) => {
            error!(error = %e, "Failed to serialize server message");
            None
        }
    }
}

impl ServerState {
    /// Send to every open connection in the room except `exclude`.
    ///
    /// Best effort: a recipient whose outbox is closed or full is skipped and
    /// the others still receive the message.
    pub fn broadcast(&self, room_id: &str, msg: &ServerMsg, exclude: Option<&PlayerId>) -> usize {
        let Some(room) = self.rooms.get(room_id) else {
            return 0;
        };
        let Some(text) = encode(msg) else {
            return 0;
        };

        room.members
            .iter()
            .filter(|member| Some(*member) != exclude)
            .filter(|member| self.connections.send(member, Outbound::Frame(text.clone())))
            .count()
    }

    /// Send directly to one connection
    pub fn send_to(&self, id: &PlayerId, msg: &ServerMsg) -> bool {
        encode(msg).is_some_and(|text| self.connections.send(id, Outbound::Frame(text)))
    }
}
