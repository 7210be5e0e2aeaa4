//! Server state aggregate and the actor task that owns it
//!
//! Every socket, room ticker and the liveness timer talks to one
//! `GameServer` task through `ServerEvent`s. Handlers therefore run one at a
//! time to completion and the maps need no locking.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::util::time::{as_millis, Millis, ServerClock, ROUND_TICK};
use crate::ws::protocol::{PlayerId, ServerMsg};

use super::liveness::LivenessPolicy;
use super::players::{ConnectionRegistry, Outbox};
use super::rooms::{RoomRegistry, TickScheduler};

/// Capacity of the server event queue
const EVENT_QUEUE: usize = 1024;

/// Events processed by the game server task
pub enum ServerEvent {
    /// Socket opened
    Connected { player_id: PlayerId, outbox: Outbox },
    /// Text frame received
    Message { player_id: PlayerId, text: String },
    /// Socket closed by the transport
    Disconnected { player_id: PlayerId },
    /// One-second room timer fired
    RoomTick { room_id: String },
    /// Counters for the health endpoint
    Stats { reply: oneshot::Sender<ServerStats> },
}

/// Live counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub rooms: usize,
    pub players: usize,
    pub connections: usize,
}

/// All mutable game state: connections, players, rooms and rounds
pub struct ServerState {
    pub connections: ConnectionRegistry,
    pub rooms: RoomRegistry,
    pub default_room: String,
    pub liveness: LivenessPolicy,
}

impl ServerState {
    pub fn new(config: &Config, scheduler: TickScheduler) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            rooms: RoomRegistry::new(scheduler),
            default_room: config.default_room.clone(),
            liveness: LivenessPolicy::from_config(config),
        }
    }

    /// State whose room ticks are driven by the caller
    #[cfg(test)]
    pub fn manual(config: &Config) -> Self {
        Self::new(config, TickScheduler::Manual)
    }

    pub fn connect(&mut self, player_id: PlayerId, outbox: Outbox) {
        self.connections.open(player_id, outbox);
        debug!(player_id = %player_id, "Connection opened");
    }

    /// Drop a connection and, if it had joined, its player and room membership
    pub fn disconnect(&mut self, player_id: &PlayerId, now: Millis) {
        self.connections.close(player_id);

        let Some(player) = self.connections.remove(player_id) else {
            return;
        };
        let room_id = player.room_id;
        let room_now_empty = self.rooms.leave(&room_id, player_id);

        info!(player_id = %player_id, room_id = %room_id, name = %player.name, "Player left");

        if !room_now_empty {
            self.broadcast(
                &room_id,
                &ServerMsg::PlayerLeft {
                    player_id: *player_id,
                },
                None,
            );
            // The leaver may have been the last one standing
            self.end_round_if_all_fallen(&room_id, now);
        }
    }

    /// Advance a room's round by one tick and broadcast what it emitted
    pub fn tick_room(&mut self, room_id: &str, now: Millis) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let mut members = self
            .connections
            .members_mut(|id| room.members.contains(id));
        let events = room.round.tick(now, &mut members);

        for event in &events {
            self.broadcast(room_id, event, None);
        }
    }

    /// Re-evaluate the all-fallen condition of a room
    pub fn end_round_if_all_fallen(&mut self, room_id: &str, now: Millis) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let connections = &self.connections;
        let members = room.members.iter().filter_map(|id| connections.get(id));
        if let Some(ended) = room.round.end_if_all_fallen(now, members) {
            self.broadcast(room_id, &ended, None);
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            rooms: self.rooms.len(),
            players: self.connections.player_count(),
            connections: self.connections.connection_count(),
        }
    }
}

/// Cloneable handle used by sockets and HTTP routes
#[derive(Clone)]
pub struct ServerHandle {
    events_tx: mpsc::Sender<ServerEvent>,
}

impl ServerHandle {
    /// Register a new connection and return its id
    pub async fn connect(&self, outbox: Outbox) -> Option<PlayerId> {
        let player_id = Uuid::new_v4();
        self.events_tx
            .send(ServerEvent::Connected { player_id, outbox })
            .await
            .ok()?;
        Some(player_id)
    }

    pub async fn message(&self, player_id: PlayerId, text: String) -> bool {
        self.events_tx
            .send(ServerEvent::Message { player_id, text })
            .await
            .is_ok()
    }

    pub async fn disconnect(&self, player_id: PlayerId) {
        let _ = self
            .events_tx
            .send(ServerEvent::Disconnected { player_id })
            .await;
    }

    /// Current counters, `None` when the server task is gone
    pub async fn stats(&self) -> Option<ServerStats> {
        let (reply, rx) = oneshot::channel();
        self.events_tx.send(ServerEvent::Stats { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// The authoritative room/round server task
pub struct GameServer {
    state: ServerState,
    events_rx: mpsc::Receiver<ServerEvent>,
    clock: ServerClock,
    sweep_period: Duration,
}

impl GameServer {
    pub fn new(config: &Config) -> (Self, ServerHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let scheduler = TickScheduler::Timer {
            period: ROUND_TICK,
            events_tx: events_tx.clone(),
        };

        let server = Self {
            state: ServerState::new(config, scheduler),
            events_rx,
            clock: ServerClock::new(),
            sweep_period: config.liveness_sweep,
        };

        (server, ServerHandle { events_tx })
    }

    /// Process events and liveness sweeps until the event channel closes
    pub async fn run(mut self) {
        info!(
            heartbeat_timeout_ms = self.state.liveness.heartbeat_timeout_ms,
            sweep_ms = as_millis(self.sweep_period),
            "Game server running"
        );

        let mut sweep = interval_at(Instant::now() + self.sweep_period, self.sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sweep.tick() => {
                    let now = self.clock.now_ms();
                    self.state.sweep(now);
                }
            }
        }

        info!("Game server stopped");
    }

    fn handle_event(&mut self, event: ServerEvent) {
        let now = self.clock.now_ms();
        match event {
            ServerEvent::Connected { player_id, outbox } => {
                self.state.connect(player_id, outbox);
            }
            ServerEvent::Message { player_id, text } => {
                match self.state.handle_text(&player_id, &text, now) {
                    Ok(()) => {}
                    Err(rejected) if rejected.is_malformed() => {
                        debug!(player_id = %player_id, error = %rejected, "Malformed message dropped");
                    }
                    Err(rejected) => {
                        debug!(player_id = %player_id, reason = %rejected, "Message ignored");
                    }
                }
            }
            ServerEvent::Disconnected { player_id } => {
                self.state.disconnect(&player_id, now);
            }
            ServerEvent::RoomTick { room_id } => {
                self.state.tick_room(&room_id, now);
            }
            ServerEvent::Stats { reply } => {
                let _ = reply.send(self.state.stats());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::players::Outbound;

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Frame(text) = outbound {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    async fn join(handle: &ServerHandle, name: &str) -> (PlayerId, mpsc::Receiver<Outbound>) {
        let (outbox, rx) = mpsc::channel(256);
        let id = handle.connect(outbox).await.unwrap();
        let join = format!(r#"{{"type":"JOIN","playerName":"{name}","roomId":"default","carModel":1}}"#);
        assert!(handle.message(id, join).await);
        (id, rx)
    }

    fn spawn_server(config: &Config) -> ServerHandle {
        let (server, handle) = GameServer::new(config);
        tokio::spawn(server.run());
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_room_starts_round_after_countdown() {
        let handle = spawn_server(&Config::default());
        let (id, mut rx) = join(&handle, "solo").await;
        handle.stats().await.unwrap();

        let first = drain(&mut rx);
        assert_eq!(
            first[0],
            ServerMsg::JoinSuccess {
                player_id: id,
                platform_size: 200.0,
                is_waiting_for_round: true,
                round_number: 0,
            }
        );
        assert_eq!(first[1], ServerMsg::ExistingPlayers { players: vec![] });

        tokio::time::sleep(Duration::from_millis(5500)).await;
        handle.stats().await.unwrap();

        let msgs = drain(&mut rx);
        let countdowns: Vec<u64> = msgs
            .iter()
            .filter_map(|m| match m {
                ServerMsg::WaitingNewRound { countdown, .. } => Some(*countdown),
                _ => None,
            })
            .collect();
        assert_eq!(countdowns, vec![4, 3, 2, 1]);
        assert_eq!(
            msgs.last(),
            Some(&ServerMsg::NewRoundStarted {
                platform_size: 200.0,
                round_number: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_player_is_kicked_and_peers_told() {
        let handle = spawn_server(&Config::default());
        let (quiet, mut quiet_rx) = join(&handle, "quiet").await;
        let (chatty, mut chatty_rx) = join(&handle, "chatty").await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(7)).await;
            assert!(
                handle
                    .message(chatty, r#"{"type":"HEARTBEAT","focused":true}"#.to_string())
                    .await
            );
        }
        handle.stats().await.unwrap();

        let mut kicked = false;
        let mut closed = false;
        while let Ok(outbound) = quiet_rx.try_recv() {
            match outbound {
                Outbound::Frame(text) => {
                    if serde_json::from_str::<ServerMsg>(&text).unwrap() == ServerMsg::Kicked {
                        kicked = true;
                    }
                }
                Outbound::Close => {
                    assert!(kicked);
                    closed = true;
                }
            }
        }
        assert!(kicked && closed);

        let chatty_msgs = drain(&mut chatty_rx);
        assert!(chatty_msgs.contains(&ServerMsg::PlayerLeft { player_id: quiet }));
        assert!(!chatty_msgs.contains(&ServerMsg::Kicked));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.players, 1);
        assert_eq!(stats.rooms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_tears_room_down() {
        let handle = spawn_server(&Config::default());
        let (id, _rx) = join(&handle, "solo").await;
        assert_eq!(handle.stats().await.unwrap().rooms, 1);

        handle.disconnect(id).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(
            stats,
            ServerStats {
                rooms: 0,
                players: 0,
                connections: 0
            }
        );
    }

    #[test]
    fn manual_ticks_shrink_only_joined_rooms() {
        let config = Config::default();
        let mut state = ServerState::manual(&config);
        state.tick_room("default", 1000);
        assert_eq!(state.stats().rooms, 0);

        let (outbox, _rx) = mpsc::channel(256);
        let id = Uuid::new_v4();
        state.connect(id, outbox);
        state
            .handle_text(&id, r#"{"type":"JOIN","playerName":"a"}"#, 0)
            .unwrap();
        for second in 1..=6 {
            state.tick_room("default", second * 1000);
        }
        let round = &state.rooms.get("default").unwrap().round;
        assert!(round.is_active());
        assert!(round.platform_size < 200.0);
        assert!(!state.rooms.get("default").unwrap().has_ticker());
    }
}
