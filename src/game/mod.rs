//! Room and round server

pub mod broadcast;
pub mod liveness;
pub mod players;
pub mod rooms;
pub mod round;
pub mod router;
pub mod server;

pub use players::Outbound;
pub use server::{GameServer, ServerHandle};
