//! WebSocket subscription transport.
//!
//! Long-lived bidirectional text-frame connection. The client authenticates
//! via the `bearer,<token>` subprotocol pair, then drives its subscription
//! with JSON control messages; the server pushes decision messages through a
//! per-connection queue owned by a forwarder task, so a slow socket never
//! touches the broadcast path.

use crate::auth::{parse_ws_subprotocol_token, Scope};
use crate::config::AuthMode;
use crate::publisher::SubscriptionFilter;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

const CLOSE_DISABLED: u16 = 1000;
const CLOSE_AUTH_REQUIRED: u16 = 4001;
const CLOSE_INSUFFICIENT_SCOPE: u16 = 4003;
const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4029;

/// Per-connection outbound queue depth; a consumer that falls this far
/// behind is evicted by the hub.
const SEND_QUEUE_DEPTH: usize = 64;

enum Verdict {
    Accept,
    Close(u16, &'static str),
}

async fn accept_verdict(state: &AppState, headers: &HeaderMap) -> Verdict {
    if !state.config.ws_enabled {
        return Verdict::Close(CLOSE_DISABLED, "WebSocket disabled");
    }
    if state.auth.mode() == AuthMode::None {
        return Verdict::Accept;
    }
    let token = headers
        .get("sec-websocket-protocol")
        .and_then(|h| h.to_str().ok())
        .and_then(parse_ws_subprotocol_token);
    let Some(token) = token else {
        return Verdict::Close(CLOSE_AUTH_REQUIRED, "Authentication required");
    };
    match state.auth.authenticate_token(&token).await {
        Ok(ctx) if ctx.has_scope(Scope::Read) => Verdict::Accept,
        Ok(_) => Verdict::Close(CLOSE_INSUFFICIENT_SCOPE, "Insufficient scope"),
        Err(_) => Verdict::Close(CLOSE_AUTH_REQUIRED, "Authentication required"),
    }
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let verdict = accept_verdict(&state, &headers).await;
    ws.protocols(["bearer"])
        .on_upgrade(move |socket| handle_socket(socket, state, verdict))
}

async fn handle_socket(socket: WebSocket, state: AppState, verdict: Verdict) {
    let (mut sink, mut stream) = socket.split();

    if let Verdict::Close(code, reason) = verdict {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_DEPTH);
    let Some(sub_id) = state.hub.register(tx.clone()) else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TOO_MANY_CONNECTIONS,
                reason: "Too many connections".into(),
            })))
            .await;
        return;
    };

    // Forwarder owns the write half; broadcasts and control replies are
    // queued, never sent inline.
    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_control(&state, &sub_id, &tx, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Connection close is the sole cancellation of the send queue.
    state.hub.remove(&sub_id);
    drop(tx);
    let _ = forwarder.await;
    info!(subscription_id = %sub_id, "WebSocket session ended");
}

async fn handle_control(
    state: &AppState,
    sub_id: &str,
    tx: &mpsc::Sender<String>,
    text: &str,
) {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        let _ = tx
            .send(
                json!({
                    "type": "error",
                    "code": "INVALID_MESSAGE",
                    "message": "Messages must be JSON objects",
                })
                .to_string(),
            )
            .await;
        return;
    };

    match message.get("action").and_then(|a| a.as_str()) {
        Some("subscribe") => {
            let filter = message
                .get("filters")
                .map(SubscriptionFilter::from_json)
                .unwrap_or_default();
            debug!(subscription_id = %sub_id, ?filter, "Subscription updated");
            state.hub.subscribe(sub_id, filter);
        }
        Some("unsubscribe") => state.hub.unsubscribe(sub_id),
        Some(other) => {
            let _ = tx
                .send(
                    json!({
                        "type": "error",
                        "code": "INVALID_ACTION",
                        "message": format!("Unknown action: {other}"),
                    })
                    .to_string(),
                )
                .await;
        }
        None => {
            if message.get("type").and_then(|t| t.as_str()) == Some("ping") {
                let _ = tx.send(json!({ "type": "pong" }).to_string()).await;
            } else {
                let _ = tx
                    .send(
                        json!({
                            "type": "error",
                            "code": "INVALID_ACTION",
                            "message": "Unknown action: none",
                        })
                        .to_string(),
                    )
                    .await;
            }
        }
    }
}
