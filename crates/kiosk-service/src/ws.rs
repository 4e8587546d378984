//! WebSocket handler for real-time kiosk events.
//!
//! Every client first receives a `snapshot` message with the machine state
//! and the active session, then each [`KioskEvent`](kiosk_types::KioskEvent)
//! as JSON, tagged by `type`. A session produces one `session_ended`; a later
//! change of its ledger sync state arrives as `session_settled`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use kiosk_core::SessionSnapshot;

use crate::state::AppState;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/ws", get(ws_handler))
}

/// First message sent on a new connection.
#[derive(Debug, Serialize)]
struct SnapshotMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    snapshot: SessionSnapshot,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so nothing falls in between
    let mut events = state.kiosk.subscribe();

    info!("WebSocket client connected");

    let snapshot = SnapshotMessage {
        kind: "snapshot",
        snapshot: state.kiosk.machine().snapshot(),
    };
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                info!("WebSocket client disconnected during initial snapshot");
                return;
            }
        }
        Err(e) => warn!("Failed to serialize snapshot: {}", e),
    }

    debug!("Sent initial snapshot to WebSocket client");

    let mut send_task = tokio::spawn(async move {
        let mut reported_missed = 0;
        while let Some(event) = events.recv().await {
            let missed = events.missed();
            if missed > reported_missed {
                warn!(
                    "WebSocket client fell behind, {} event(s) dropped",
                    missed - reported_missed
                );
                reported_missed = missed;
            }

            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping"),
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }

    info!("WebSocket client disconnected");
}
