use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::models::{WsChatRequest, WsEvent};
use crate::service::chat_service::ChatService;
use crate::store::StoreEvent;

/// GET `/ws/chat` — upgrades to a WebSocket for streaming chat.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, svc))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends JSON `{ "session_id": "...|null", "message": "..." }`
/// - Server streams back:
///   1. `{ "type": "stream_start", "session_id": "...", "message_id": "..." }`
///   2. `{ "type": "stream_update", "message_id": "...", "content": "..." }` (repeated,
///      `content` is the whole reply so far)
///   3. `{ "type": "stream_end", "message_id": "...", "full_content": "..." }`
///   or `{ "type": "error", "message": "..." }` when the request is rejected.
async fn handle_socket(mut socket: WebSocket, svc: ChatService) {
    info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        // Only handle text messages
        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let ws_req: WsChatRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    message: format!("Invalid request: {e}"),
                }).await;
                continue;
            }
        };

        // Subscribe before the turn starts so no update is missed.
        let mut events = svc.store().subscribe();

        // ── Prepare: validate, resolve session, append messages ──────────
        let turn = match svc.begin_turn(ws_req.session_id.as_deref(), &ws_req.message) {
            Ok(turn) => turn,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error { message: e.to_string() }).await;
                continue;
            }
        };
        let message_id = turn.assistant_message.id.clone();

        send_event(&mut socket, &WsEvent::StreamStart {
            session_id: turn.session_id.clone(),
            message_id: message_id.clone(),
        }).await;

        // ── Run the turn, forwarding updates to the reply ────────────────
        let mut runner = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.run_turn(turn).await })
        };

        // Updates are preferred over completion so none is left unsent.
        let finished = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(StoreEvent::MessageUpdated { message, .. }) if message.id == message_id => {
                        send_event(&mut socket, &WsEvent::StreamUpdate {
                            message_id: message.id,
                            content: message.content,
                        }).await;
                    }
                    Ok(_) | Err(RecvError::Closed) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged, skipped {skipped} store events");
                    }
                },
                finished = &mut runner => break finished,
            }
        };

        match finished {
            Ok(outcome) => {
                send_event(&mut socket, &WsEvent::StreamEnd {
                    message_id: outcome.message.id,
                    full_content: outcome.message.content,
                }).await;
            }
            Err(e) => {
                error!("Chat turn panicked: {e}");
                send_event(&mut socket, &WsEvent::Error {
                    message: "Internal error during streaming".to_string(),
                }).await;
            }
        }
    }

    info!("WebSocket client disconnected");
}

/// Helper: serialize a `WsEvent` and send it over the socket.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}
