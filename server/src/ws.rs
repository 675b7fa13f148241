//! WebSocket event relay.
//!
//! On connect the server sends `{type: WS_CONNECTED, job_id}` and then
//! forwards every payload published on `ws:{job_id}` verbatim until the
//! client closes.

use crate::api::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use conveyor_core::events::JobEvent;
use conveyor_engine::events::EventPublisher;
use std::sync::Arc;
use uuid::Uuid;

pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| relay(state, job_id, socket))
}

async fn relay(state: Arc<AppState>, job_id: Uuid, mut socket: WebSocket) {
    let channel = EventPublisher::channel(job_id);
    let mut events = match state.state.subscribe(&channel).await {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!(
                event = "conveyor.ws.subscribe_failed",
                job_id = %job_id,
                error = %err,
                "closing socket without subscription"
            );
            return;
        }
    };

    let hello = match serde_json::to_string(&JobEvent::Connected { job_id }) {
        Ok(hello) => hello,
        Err(err) => {
            tracing::error!(
                event = "conveyor.ws.encode_failed",
                job_id = %job_id,
                error = %err,
                "failed to encode greeting"
            );
            return;
        }
    };
    if socket.send(Message::Text(hello)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            published = events.recv() => {
                let Some(payload) = published else {
                    // Publisher side went away; nothing more to relay.
                    break;
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Clients only listen; ignore anything they send.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!(
        event = "conveyor.ws.closed",
        job_id = %job_id,
        "event stream closed"
    );
}
