use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use garita_core::events::StateChanged;
use garita_sdk::objects::ws::{WsCloseCode, WsServerMessage};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::shutdown::wait_for_shutdown;
use crate::state::AppState;

pub(super) fn router() -> Router<AppState> {
    Router::new().route("/ws/access-events", get(access_events_ws))
}

/// `GET /ws/access-events`: access-events stream.
///
/// Upgrades the HTTP connection to a WebSocket and pushes a
/// `state-changed` frame for every registration that moves to a new
/// lifecycle state. Frames missed while the client lagged are not replayed.
async fn access_events_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_access_events_ws(socket, state))
}

fn to_message(changed: StateChanged) -> WsServerMessage {
    WsServerMessage::StateChanged {
        registration_id: changed.registration_id,
    }
}

/// Background task that drives a single WebSocket connection.
///
/// Relays fan-out messages until the client disconnects, the channel
/// closes or the server shuts down.
async fn handle_access_events_ws(mut socket: WebSocket, state: AppState) {
    let mut updates = BroadcastStream::new(state.notify_tx.subscribe());
    let shutdown = wait_for_shutdown(state.shutdown_rx.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: WsCloseCode::GOING_AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                return;
            }

            update = updates.next() => {
                match update {
                    Some(Ok(changed)) => {
                        if send_json(&mut socket, &to_message(changed)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                        tracing::warn!(skipped = n, "WS: access-events receiver lagged");
                    }
                    None => break,
                }
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        return;
                    }
                    Some(Ok(_)) => {
                    }
                    Some(Err(_)) => {
                        return;
                    }
                }
            }
        }
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: WsCloseCode::GOING_AWAY,
            reason: "event channel closed".into(),
        })))
        .await;
}

/// Serialize `value` as JSON and send it as a text WebSocket frame.
///
/// Returns `Err(())` if the send fails (client disconnected).
async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let json = serde_json::to_string(value).map_err(|_| ())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
