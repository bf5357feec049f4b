// =============================================================================
// WebSocket Handler — Push-based render updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate full `snapshot` on connect.
//   2. Every update the feed engine forwards afterwards (`tail`, `snapshot`,
//      `log`), already rate-limited by the render throttle.
//
// A client that falls too far behind the broadcast channel is resynchronised
// with a fresh snapshot instead of being disconnected.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::{AppState, FeedUpdate};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted -- upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Manages a single WebSocket connection lifecycle.
///
/// Runs two branches via `tokio::select!`:
///   1. **Push** -- forward each broadcast update to the client.
///   2. **Recv** -- process incoming client messages (Ping, Close).
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    // Subscribe before taking the snapshot so nothing slips between them.
    let mut updates = state.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let mut sequence: u64 = 0;

    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "Failed to send initial WebSocket snapshot");
        return;
    }

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = outbound(update, &state) else {
                    break;
                };
                if let Err(e) = send_update(&mut sender, &update, &mut sequence).await {
                    debug!(error = %e, "WebSocket send failed -- disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong -- disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received -- disconnecting");
                        break;
                    }
                    // Renderers only listen.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error -- disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(sent = sequence, "WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

/// What to send for one broadcast receive. A lagged client gets a fresh
/// snapshot in place of everything it missed; `None` ends the connection.
fn outbound(received: Result<FeedUpdate, RecvError>, state: &AppState) -> Option<FeedUpdate> {
    match received {
        Ok(update) => Some(update),
        Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "WebSocket client lagged -- resending snapshot");
            Some(FeedUpdate::Snapshot(state.market()))
        }
        Err(RecvError::Closed) => {
            info!("Update channel closed -- disconnecting");
            None
        }
    }
}

async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    send_update(sender, &FeedUpdate::Snapshot(state.market()), sequence).await
}

/// Serialize and send one update. Serialisation failures are logged and
/// skipped; only transport errors end the connection.
async fn send_update<S>(
    sender: &mut S,
    update: &FeedUpdate,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(update) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            *sequence += 1;
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "Failed to serialize feed update");
            Ok(())
        }
    }
}
