//! Shrink Arena Server - authoritative room/round server
//!
//! Clients simulate their own vehicles; this server tracks who is in which
//! room, runs the shared shrinking-platform round loop and relays per-player
//! state over WebSockets.

mod app;
mod config;
mod game;
mod http;
mod util;
mod ws;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    init_server_time();

    info!(
        default_room = %config.default_room,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "Starting Shrink Arena Server"
    );

    // The game server task owns every room; handlers reach it via `state.server`
    let (state, game_server) = AppState::new(config.clone());
    tokio::spawn(game_server.run());

    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Listening for WebSocket clients on /ws");

    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shrink Arena Server stopped");
    Ok(())
}

/// `RUST_LOG` wins over `LOG_LEVEL`
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, draining connections");
        }
        _ = terminate => {
            info!("SIGTERM received, draining connections");
        }
    }
}
