//! Room registry: membership sets, round states and per-room tick timers

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::util::time::Millis;
use crate::ws::protocol::PlayerId;

use super::round::RoundState;
use super::server::ServerEvent;

/// How rooms get their once-per-tick callback
#[derive(Clone)]
pub enum TickScheduler {
    /// No timers; ticks are driven by the caller
    #[cfg(test)]
    Manual,
    /// Spawn a timer task per room posting `RoomTick` events
    Timer {
        period: Duration,
        events_tx: mpsc::Sender<ServerEvent>,
    },
}

impl TickScheduler {
    fn start(&self, room_id: &str) -> Option<RoomTicker> {
        match self {
            #[cfg(test)]
            Self::Manual => None,
            Self::Timer { period, events_tx } => Some(RoomTicker::spawn(
                room_id.to_string(),
                *period,
                events_tx.clone(),
            )),
        }
    }
}

/// Running tick timer of a room; aborted when dropped
pub struct RoomTicker {
    handle: JoinHandle<()>,
}

impl RoomTicker {
    fn spawn(room_id: String, period: Duration, events_tx: mpsc::Sender<ServerEvent>) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            // Missed ticks are dropped, a stalled room does not catch up
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let event = ServerEvent::RoomTick {
                    room_id: room_id.clone(),
                };
                if events_tx.send(event).await.is_err() {
                    debug!(room_id = %room_id, "Server gone, stopping room ticker");
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for RoomTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A room: member ids plus its round
pub struct Room {
    pub members: HashSet<PlayerId>,
    pub round: RoundState,
    // Dropped with the room, which stops the timer
    #[allow(dead_code)]
    ticker: Option<RoomTicker>,
}

impl Room {
    #[cfg(test)]
    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }
}

/// Registry of all rooms with at least one member
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    scheduler: TickScheduler,
}

impl RoomRegistry {
    pub fn new(scheduler: TickScheduler) -> Self {
        Self {
            rooms: HashMap::new(),
            scheduler,
        }
    }

    /// Create the room and its round on first use.
    /// Returns true when the room was created by this call.
    pub fn ensure_room(&mut self, room_id: &str, now: Millis) -> bool {
        if self.rooms.contains_key(room_id) {
            return false;
        }

        let room = Room {
            members: HashSet::new(),
            round: RoundState::new(now, rand::random::<u64>()),
            ticker: self.scheduler.start(room_id),
        };
        self.rooms.insert(room_id.to_string(), room);

        info!(room_id = %room_id, "Room created");
        true
    }

    /// Add a member to an existing room
    pub fn join(&mut self, room_id: &str, player_id: PlayerId) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => room.members.insert(player_id),
            None => false,
        }
    }

    /// Remove a member. Returns true when the room became empty, in which
    /// case the room, its round and its ticker are already gone.
    pub fn leave(&mut self, room_id: &str, player_id: &PlayerId) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.members.remove(player_id);
        if !room.members.is_empty() {
            return false;
        }

        self.rooms.remove(room_id);
        info!(room_id = %room_id, "Room closed");
        true
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Member ids of a room (empty for unknown rooms)
    #[cfg(test)]
    pub fn members(&self, room_id: &str) -> Vec<PlayerId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }
}
