//! WebSocket push channel, one topic per conversation.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/socket/{conversation_id}", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(conversation_id = %conversation_id, "Task socket connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, conversation_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, conversation_id: String) {
    let mut rx = match state.hub.subscribe(&conversation_id) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to join conversation topic");
            return;
        }
    };
    info!(conversation_id = %conversation_id, "Task socket joined conversation");

    loop {
        tokio::select! {
            result = rx.recv() => match result {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        debug!(conversation_id = %conversation_id, "Task socket closed during send");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Polling still delivers whatever was skipped here
                    warn!(conversation_id = %conversation_id, missed, "Task socket lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conversation_id = %conversation_id, error = %e, "Task socket error");
                    break;
                }
            },
        }
    }
    info!(conversation_id = %conversation_id, "Task socket disconnected");
}
