//! Round lifecycle engine: per-room wait/active state machine and platform shrink
//!
//! The engine never touches the network. `RoundState::tick` mutates the round
//! and its members and returns the messages to broadcast to the room.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::util::time::Millis;
use crate::ws::protocol::ServerMsg;

use super::players::Player;

/// Platform edge length at the start of every round
pub const PLATFORM_SIZE: f64 = 200.0;
/// Ticks for a full platform to collapse
pub const SHRINK_TICKS: u32 = 60;
/// Countdown between rounds
pub const WAIT_DURATION_MS: Millis = 5_000;
/// Spawn coordinates are drawn from `[-SPAWN_HALF_EXTENT, SPAWN_HALF_EXTENT]`
pub const SPAWN_HALF_EXTENT: f64 = 60.0;

/// Float residue treated as a fully collapsed platform
const COLLAPSE_EPSILON: f64 = 1e-6;

/// Round phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Countdown towards the next round
    WaitingToStart,
    /// Platform is shrinking
    Active,
}

/// Round state (one per room)
pub struct RoundState {
    pub platform_size: f64,
    pub shrink_rate_per_tick: f64,
    pub round_number: u64,
    pub phase: RoundPhase,
    pub phase_started_at: Millis,
    pub wait_duration_ms: Millis,
    pub game_start_time: Millis,
    rng: ChaCha8Rng,
}

impl RoundState {
    pub fn new(now: Millis, seed: u64) -> Self {
        Self {
            platform_size: PLATFORM_SIZE,
            shrink_rate_per_tick: PLATFORM_SIZE / f64::from(SHRINK_TICKS),
            round_number: 0,
            phase: RoundPhase::WaitingToStart,
            phase_started_at: now,
            wait_duration_ms: WAIT_DURATION_MS,
            game_start_time: now,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == RoundPhase::Active
    }

    /// Advance the round by one tick.
    ///
    /// An empty room is paused: nothing shrinks and nothing is emitted.
    pub fn tick(&mut self, now: Millis, members: &mut [&mut Player]) -> Vec<ServerMsg> {
        if members.is_empty() {
            return Vec::new();
        }

        match self.phase {
            RoundPhase::WaitingToStart => {
                let elapsed = now.saturating_sub(self.phase_started_at);
                if elapsed >= self.wait_duration_ms {
                    vec![self.start_round(now, members)]
                } else {
                    let remaining = self.wait_duration_ms - elapsed;
                    vec![ServerMsg::WaitingNewRound {
                        countdown: remaining.div_ceil(1000),
                        round_number: self.round_number + 1,
                    }]
                }
            }
            RoundPhase::Active => {
                if let Some(ended) = self.end_if_all_fallen(now, members.iter().map(|p| &**p)) {
                    return vec![ended];
                }

                self.shrink();
                let mut events = vec![ServerMsg::PlatformUpdate {
                    platform_size: self.platform_size,
                    round_number: self.round_number,
                }];

                if self.platform_size <= 0.0 {
                    events.extend(self.collapse(now, members));
                }
                events
            }
        }
    }

    fn shrink(&mut self) {
        let next = self.platform_size - self.shrink_rate_per_tick;
        self.platform_size = if next < COLLAPSE_EPSILON { 0.0 } else { next };
    }

    /// WaitingToStart -> Active: reset the platform and scatter every member
    fn start_round(&mut self, now: Millis, members: &mut [&mut Player]) -> ServerMsg {
        self.platform_size = PLATFORM_SIZE;
        self.round_number += 1;
        self.phase = RoundPhase::Active;
        self.phase_started_at = now;
        self.game_start_time = now;

        for player in members.iter_mut() {
            player.position = [
                self.rng.gen_range(-SPAWN_HALF_EXTENT..=SPAWN_HALF_EXTENT),
                1.0,
                self.rng.gen_range(-SPAWN_HALF_EXTENT..=SPAWN_HALF_EXTENT),
            ];
            player.rotation = self.rng.gen_range(0.0..std::f64::consts::TAU);
            player.falling = false;
            player.survival_time = 0;
            player.join_time = now;
            player.is_waiting_for_round = false;
        }

        info!(round = self.round_number, players = members.len(), "Round started");

        ServerMsg::NewRoundStarted {
            platform_size: self.platform_size,
            round_number: self.round_number,
        }
    }

    /// Platform reached zero: everyone still standing falls, then the round ends.
    ///
    /// Only players taking part in the round are forced down. Late joiners
    /// already waiting for the next round get no `PLAYER_FELL`. Every forced
    /// player is parked until the next round starts.
    fn collapse(&mut self, now: Millis, members: &mut [&mut Player]) -> Vec<ServerMsg> {
        let mut events = Vec::new();
        for player in members.iter_mut().filter(|p| p.is_alive_in_round()) {
            events.extend(mark_fallen(player, now));
            player.is_waiting_for_round = true;
        }
        events.push(self.end_round(now));
        events
    }

    /// Active -> WaitingToStart
    fn end_round(&mut self, now: Millis) -> ServerMsg {
        self.phase = RoundPhase::WaitingToStart;
        self.phase_started_at = now;
        info!(
            round = self.round_number,
            duration_ms = now.saturating_sub(self.game_start_time),
            "Round ended"
        );
        ServerMsg::RoundEnded {
            round_number: self.round_number,
        }
    }

    /// End an active round early once nobody in it is still standing
    pub fn end_if_all_fallen<'a, I>(&mut self, now: Millis, members: I) -> Option<ServerMsg>
    where
        I: IntoIterator<Item = &'a Player>,
    {
        if !self.is_active() {
            return None;
        }
        let mut members = members.into_iter();
        if members.any(Player::is_alive_in_round) {
            return None;
        }
        Some(self.end_round(now))
    }
}

/// Mark a player as fallen and compute its survival time.
///
/// Returns `None` when the player is already falling, so repeated reports
/// produce a single broadcast. A fallen player stays in the round and may
/// respawn.
pub fn mark_fallen(player: &mut Player, now: Millis) -> Option<ServerMsg> {
    if player.falling {
        return None;
    }
    player.falling = true;
    player.survival_time = now.saturating_sub(player.join_time);
    Some(ServerMsg::PlayerFell {
        player_id: player.id,
        survival_time: player.survival_time,
    })
}
