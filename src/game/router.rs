//! Inbound message dispatch
//!
//! Every handler either applies its effect or reports why the message was
//! dropped. Nothing is ever answered with an error frame.

use tracing::info;

use crate::util::time::Millis;
use crate::ws::protocol::{CarModel, ClientMsg, PlayerId, Position, ServerMsg};

use super::round::mark_fallen;
use super::server::ServerState;

/// Why an inbound message had no effect
#[derive(Debug, thiserror::Error)]
pub enum Rejected {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown connection")]
    NotConnected,

    #[error("connection has not joined")]
    NotJoined,

    #[error("connection already joined")]
    AlreadyJoined,

    #[error("player is waiting for the next round")]
    WaitingForRound,

    #[error("player is already falling")]
    AlreadyFalling,
}

impl Rejected {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

impl ServerState {
    /// Parse and dispatch one text frame
    pub fn handle_text(&mut self, id: &PlayerId, text: &str, now: Millis) -> Result<(), Rejected> {
        let msg: ClientMsg = serde_json::from_str(text)?;
        self.dispatch(id, msg, now)
    }

    pub fn dispatch(&mut self, id: &PlayerId, msg: ClientMsg, now: Millis) -> Result<(), Rejected> {
        match msg {
            ClientMsg::Join {
                player_name,
                room_id,
                car_model,
            } => self.handle_join(id, player_name, room_id, car_model, now),
            ClientMsg::UpdatePosition {
                position,
                rotation,
                car_model,
            } => self.handle_update_position(id, position, rotation, car_model),
            ClientMsg::PlayerFell => self.handle_player_fell(id, now),
            ClientMsg::Respawn {
                position,
                rotation,
                car_model,
            } => self.handle_respawn(id, position, rotation, car_model),
            ClientMsg::Heartbeat { focused } => self.handle_heartbeat(id, focused, now),
            ClientMsg::Inactive => {
                if self.connections.mark_inactive(id, now) {
                    Ok(())
                } else {
                    Err(Rejected::NotJoined)
                }
            }
            ClientMsg::Ping => {
                if !self.connections.is_open(id) {
                    return Err(Rejected::NotConnected);
                }
                self.send_to(id, &ServerMsg::Pong);
                Ok(())
            }
        }
    }

    fn handle_join(
        &mut self,
        id: &PlayerId,
        player_name: String,
        room_id: Option<String>,
        car_model: CarModel,
        now: Millis,
    ) -> Result<(), Rejected> {
        if !self.connections.is_open(id) {
            return Err(Rejected::NotConnected);
        }
        if self.connections.get(id).is_some() {
            return Err(Rejected::AlreadyJoined);
        }

        let room_id = room_id
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| self.default_room.clone());
        self.rooms.ensure_room(&room_id, now);

        let player = self
            .connections
            .register(*id, player_name, car_model, room_id.clone(), now)
            .ok_or(Rejected::NotConnected)?;
        let info = player.info();
        self.rooms.join(&room_id, *id);

        let Some(room) = self.rooms.get(&room_id) else {
            return Ok(());
        };
        let join_success = ServerMsg::JoinSuccess {
            player_id: *id,
            platform_size: room.round.platform_size,
            is_waiting_for_round: info.is_waiting_for_round,
            round_number: room.round.round_number,
        };
        let existing = room
            .members
            .iter()
            .filter(|member| *member != id)
            .filter_map(|member| self.connections.get(member))
            .map(|p| p.info())
            .collect();

        self.send_to(id, &join_success);
        self.send_to(id, &ServerMsg::ExistingPlayers { players: existing });

        info!(
            player_id = %id,
            room_id = %room_id,
            name = %info.name,
            car_model = %info.car_model,
            "Player joined"
        );

        self.broadcast(&room_id, &ServerMsg::PlayerJoined { player: info }, Some(id));
        Ok(())
    }

    fn handle_update_position(
        &mut self,
        id: &PlayerId,
        position: Position,
        rotation: f64,
        car_model: CarModel,
    ) -> Result<(), Rejected> {
        let player = self.connections.get_mut(id).ok_or(Rejected::NotJoined)?;
        if player.is_waiting_for_round {
            return Err(Rejected::WaitingForRound);
        }

        player.position = position;
        player.rotation = rotation;
        player.car_model = car_model.clone();
        let room_id = player.room_id.clone();

        let update = ServerMsg::PlayerUpdate {
            player_id: *id,
            position,
            rotation,
            car_model,
        };
        self.broadcast(&room_id, &update, Some(id));
        Ok(())
    }

    fn handle_player_fell(&mut self, id: &PlayerId, now: Millis) -> Result<(), Rejected> {
        let player = self.connections.get_mut(id).ok_or(Rejected::NotJoined)?;
        let fell = mark_fallen(player, now).ok_or(Rejected::AlreadyFalling)?;
        let room_id = player.room_id.clone();

        self.broadcast(&room_id, &fell, Some(id));
        self.end_round_if_all_fallen(&room_id, now);
        Ok(())
    }

    fn handle_respawn(
        &mut self,
        id: &PlayerId,
        position: Position,
        rotation: f64,
        car_model: CarModel,
    ) -> Result<(), Rejected> {
        let player = self.connections.get_mut(id).ok_or(Rejected::NotJoined)?;
        player.position = position;
        player.rotation = rotation;
        player.car_model = car_model.clone();
        player.falling = false;
        let room_id = player.room_id.clone();

        let respawn = ServerMsg::PlayerRespawn {
            player_id: *id,
            position,
            rotation,
            car_model,
        };
        self.broadcast(&room_id, &respawn, Some(id));
        Ok(())
    }

    fn handle_heartbeat(&mut self, id: &PlayerId, focused: bool, now: Millis) -> Result<(), Rejected> {
        if !self.connections.touch_heartbeat(id, focused, now) {
            return Err(Rejected::NotJoined);
        }
        self.send_to(id, &ServerMsg::Pong);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::game::players::Outbound;
    use crate::game::round::RoundPhase;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Client {
        id: PlayerId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMsg> {
            let mut out = Vec::new();
            while let Ok(outbound) = self.rx.try_recv() {
                if let Outbound::Frame(text) = outbound {
                    out.push(serde_json::from_str(&text).unwrap());
                }
            }
            out
        }
    }

    fn connect(state: &mut ServerState) -> Client {
        let (outbox, rx) = mpsc::channel(512);
        let id = Uuid::new_v4();
        state.connect(id, outbox);
        Client { id, rx }
    }

    fn joined(state: &mut ServerState, name: &str, now: Millis) -> Client {
        let mut client = connect(state);
        let join = format!(r#"{{"type":"JOIN","playerName":"{name}","roomId":"default","carModel":"1"}}"#);
        state.handle_text(&client.id, &join, now).unwrap();
        client.drain();
        client
    }

    /// Run the countdown so the room is in an active round at t = 5000
    fn start_round(state: &mut ServerState) {
        for second in 1..=5 {
            state.tick_room("default", second * 1000);
        }
        assert_eq!(
            state.rooms.get("default").unwrap().round.phase,
            RoundPhase::Active
        );
    }

    #[test]
    fn join_replies_and_announces() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "ana", 0);

        let mut b = connect(&mut state);
        state
            .handle_text(
                &b.id,
                r#"{"type":"JOIN","playerName":"bo","carModel":4}"#,
                10,
            )
            .unwrap();

        let b_msgs = b.drain();
        assert_eq!(
            b_msgs[0],
            ServerMsg::JoinSuccess {
                player_id: b.id,
                platform_size: 200.0,
                is_waiting_for_round: true,
                round_number: 0,
            }
        );
        let ServerMsg::ExistingPlayers { players } = &b_msgs[1] else {
            panic!("expected EXISTING_PLAYERS, got {:?}", b_msgs[1]);
        };
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].id, a.id);
        assert_eq!(players[0].name, "ana");

        let a_msgs = a.drain();
        assert_eq!(a_msgs.len(), 1);
        let ServerMsg::PlayerJoined { player } = &a_msgs[0] else {
            panic!("expected PLAYER_JOINED, got {:?}", a_msgs[0]);
        };
        assert_eq!(player.id, b.id);
        assert_eq!(player.car_model, CarModel::new("4"));
        assert_eq!(player.position, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn second_join_is_rejected() {
        let mut state = ServerState::manual(&Config::default());
        let a = joined(&mut state, "ana", 0);
        let err = state
            .handle_text(&a.id, r#"{"type":"JOIN","playerName":"again"}"#, 5)
            .unwrap_err();
        assert!(matches!(err, Rejected::AlreadyJoined));
        assert_eq!(state.connections.get(&a.id).unwrap().name, "ana");
    }

    #[test]
    fn position_update_reaches_peers_only() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        a.drain();
        b.drain();

        state
            .handle_text(
                &a.id,
                r#"{"type":"UPDATE_POSITION","position":[1,1,1],"rotation":0.5,"carModel":"2"}"#,
                5100,
            )
            .unwrap();

        assert_eq!(
            b.drain(),
            vec![ServerMsg::PlayerUpdate {
                player_id: a.id,
                position: [1.0, 1.0, 1.0],
                rotation: 0.5,
                car_model: CarModel::new("2"),
            }]
        );
        assert!(a.drain().is_empty());
        assert_eq!(state.connections.get(&a.id).unwrap().position, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn waiting_players_cannot_move() {
        let mut state = ServerState::manual(&Config::default());
        let a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);

        let err = state
            .handle_text(
                &a.id,
                r#"{"type":"UPDATE_POSITION","position":[9,9,9],"rotation":1,"carModel":1}"#,
                100,
            )
            .unwrap_err();
        assert!(matches!(err, Rejected::WaitingForRound));
        assert!(b.drain().is_empty());
    }

    #[test]
    fn fall_is_broadcast_once() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        a.drain();
        b.drain();

        state.handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 8000).unwrap();
        let err = state
            .handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 9000)
            .unwrap_err();
        assert!(matches!(err, Rejected::AlreadyFalling));

        assert_eq!(
            b.drain(),
            vec![ServerMsg::PlayerFell {
                player_id: a.id,
                survival_time: 3000
            }]
        );
        assert!(a.drain().is_empty());
        assert_eq!(state.connections.get(&a.id).unwrap().survival_time, 3000);
    }

    #[test]
    fn last_fall_ends_round_immediately() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        state.tick_room("default", 6000);
        a.drain();
        b.drain();

        state.handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 6500).unwrap();
        state.handle_text(&b.id, r#"{"type":"PLAYER_FELL"}"#, 6700).unwrap();

        let a_msgs = a.drain();
        assert_eq!(
            a_msgs,
            vec![
                ServerMsg::PlayerFell {
                    player_id: b.id,
                    survival_time: 1700
                },
                ServerMsg::RoundEnded { round_number: 1 },
            ]
        );
        let round = &state.rooms.get("default").unwrap().round;
        assert_eq!(round.phase, RoundPhase::WaitingToStart);
        assert!(round.platform_size > 0.0);
    }

    #[test]
    fn respawn_clears_fall_and_relays() {
        let mut state = ServerState::manual(&Config::default());
        let a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        state.handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 6000).unwrap();
        b.drain();

        state
            .handle_text(
                &a.id,
                r#"{"type":"RESPAWN","position":[0,1,0],"rotation":0,"carModel":3}"#,
                7000,
            )
            .unwrap();
        assert!(!state.connections.get(&a.id).unwrap().falling);
        assert_eq!(
            b.drain(),
            vec![ServerMsg::PlayerRespawn {
                player_id: a.id,
                position: [0.0, 1.0, 0.0],
                rotation: 0.0,
                car_model: CarModel::new("3"),
            }]
        );

        // A new fall after respawn is reported again
        assert!(state
            .handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 7500)
            .is_ok());
    }

    #[test]
    fn respawned_player_keeps_driving_and_holds_round_open() {
        let mut state = ServerState::manual(&Config::default());
        let a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        state.handle_text(&a.id, r#"{"type":"PLAYER_FELL"}"#, 6000).unwrap();
        state
            .handle_text(
                &a.id,
                r#"{"type":"RESPAWN","position":[0,1,0],"rotation":0,"carModel":"1"}"#,
                6500,
            )
            .unwrap();
        b.drain();

        state
            .handle_text(
                &a.id,
                r#"{"type":"UPDATE_POSITION","position":[2,1,3],"rotation":1.5,"carModel":"1"}"#,
                7000,
            )
            .unwrap();
        assert_eq!(
            b.drain(),
            vec![ServerMsg::PlayerUpdate {
                player_id: a.id,
                position: [2.0, 1.0, 3.0],
                rotation: 1.5,
                car_model: CarModel::new("1"),
            }]
        );

        state.handle_text(&b.id, r#"{"type":"PLAYER_FELL"}"#, 7500).unwrap();
        assert_eq!(
            state.rooms.get("default").unwrap().round.phase,
            RoundPhase::Active
        );
    }

    #[test]
    fn heartbeat_and_ping_answer_pong() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "a", 0);
        state
            .handle_text(&a.id, r#"{"type":"HEARTBEAT","focused":false}"#, 2000)
            .unwrap();
        assert_eq!(a.drain(), vec![ServerMsg::Pong]);
        let player = state.connections.get(&a.id).unwrap();
        assert_eq!(player.last_heartbeat, 2000);
        assert!(player.inactive);

        let mut lurker = connect(&mut state);
        state.handle_text(&lurker.id, r#"{"type":"PING"}"#, 0).unwrap();
        assert_eq!(lurker.drain(), vec![ServerMsg::Pong]);
        assert!(matches!(
            state.handle_text(&lurker.id, r#"{"type":"HEARTBEAT"}"#, 0),
            Err(Rejected::NotJoined)
        ));
    }

    #[test]
    fn malformed_and_unknown_are_dropped_silently() {
        let mut state = ServerState::manual(&Config::default());
        let mut a = joined(&mut state, "a", 0);

        for text in ["{", r#"{"type":"FLY"}"#, r#"{"type":"RESPAWN"}"#, "42"] {
            let err = state.handle_text(&a.id, text, 10).unwrap_err();
            assert!(err.is_malformed());
        }
        assert!(a.drain().is_empty());

        let ghost = Uuid::new_v4();
        assert!(matches!(
            state.handle_text(&ghost, r#"{"type":"PLAYER_FELL"}"#, 10),
            Err(Rejected::NotJoined)
        ));
        assert!(matches!(
            state.handle_text(&ghost, r#"{"type":"PING"}"#, 10),
            Err(Rejected::NotConnected)
        ));
    }

    #[test]
    fn leaving_announces_and_can_end_round() {
        let mut state = ServerState::manual(&Config::default());
        let a = joined(&mut state, "a", 0);
        let mut b = joined(&mut state, "b", 0);
        start_round(&mut state);
        state.handle_text(&b.id, r#"{"type":"PLAYER_FELL"}"#, 6000).unwrap();
        b.drain();

        state.disconnect(&a.id, 6500);
        assert_eq!(
            b.drain(),
            vec![
                ServerMsg::PlayerLeft { player_id: a.id },
                ServerMsg::RoundEnded { round_number: 1 },
            ]
        );
        assert!(state.connections.get(&a.id).is_none());
        assert_eq!(state.rooms.members("default"), vec![b.id]);
    }
}
