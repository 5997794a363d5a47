use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use urgent_contracts::UrgentEvent;

use super::AppState;

/// Upgrades to a WebSocket that receives every lifecycle event as a JSON text frame.
/// Inbound frames other than close are ignored.
pub(super) async fn stream_events(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.notifier.subscribe();
    ws.on_upgrade(move |socket| relay(socket, rx))
}

async fn relay(mut socket: WebSocket, mut rx: broadcast::Receiver<UrgentEvent>) {
    crate::metrics::observer_connected();
    tracing::debug!("realtime observer connected");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(event = event.name(), error = %err, "failed to encode event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "realtime observer fell behind; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    crate::metrics::observer_disconnected();
    tracing::debug!("realtime observer disconnected");
}
