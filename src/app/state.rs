//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{GameServer, ServerHandle};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub server: ServerHandle,
}

impl AppState {
    /// Build the state and the game server task it talks to.
    /// The caller spawns the returned server.
    pub fn new(config: Config) -> (Self, GameServer) {
        let config = Arc::new(config);

        // Initialize the room/round server
        let (game_server, server) = GameServer::new(&config);

        (Self { config, server }, game_server)
    }
}
