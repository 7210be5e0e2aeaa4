//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::{Outbound, ServerHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::PlayerId;

/// Frames buffered per connection before sends are skipped
const OUTBOX_CAPACITY: usize = 64;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (outbox, outbox_rx) = mpsc::channel::<Outbound>(OUTBOX_CAPACITY);

    let Some(player_id) = state.server.connect(outbox).await else {
        error!("Game server unavailable, dropping connection");
        return;
    };
    info!(player_id = %player_id, "New WebSocket connection");

    let rate_limiter = ConnectionRateLimiter::new(state.config.message_rate_limit);
    run_session(player_id, socket, outbox_rx, &state.server, rate_limiter).await;

    // Cleanup on disconnect (no-op when the server already kicked us)
    state.server.disconnect(player_id).await;

    info!(player_id = %player_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    player_id: PlayerId,
    socket: WebSocket,
    mut outbox_rx: mpsc::Receiver<Outbound>,
    server: &ServerHandle,
    rate_limiter: ConnectionRateLimiter,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Spawn writer task: outbox -> WebSocket
    let mut writer_handle = tokio::spawn(async move {
        while let Some(outbound) = outbox_rx.recv().await {
            let result = match outbound {
                Outbound::Frame(text) => ws_sink.send(Message::Text(text)).await,
                Outbound::Close => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!(player_id = %player_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> game server
    let reader = async {
        while let Some(result) = ws_stream.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if !rate_limiter.check_message() {
                        debug!(player_id = %player_id, "Rate limited message dropped");
                        continue;
                    }
                    if !server.message(player_id, text).await {
                        debug!(player_id = %player_id, "Game server closed");
                        break;
                    }
                }
                Ok(Message::Binary(_)) => {
                    warn!(player_id = %player_id, "Received binary message, ignoring");
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    info!(player_id = %player_id, "Client initiated close");
                    break;
                }
                Err(e) => {
                    debug!(player_id = %player_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }
    };

    // A kick closes the writer; stop reading without waiting for the peer
    tokio::select! {
        _ = reader => {}
        _ = &mut writer_handle => {}
    }

    // Abort writer task
    writer_handle.abort();
}
