//! # WebSocket Downstream Bridge
//!
//! Accepts browser sessions with axum and turns socket activity into the four
//! lifecycle signals the [`SessionController`](crate::core::SessionController)
//! understands. Each session runs two halves:
//!
//! - a writer task draining the client's outbound queue into the socket, and
//! - the reader loop in `serve_client`, which feeds text frames to the relay
//!   until the socket closes or fails.
//!
//! The router also exposes `/health` and `/status` for monitoring.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};

use crate::core::connection::{ClientConnection, OutboundFrame};
use crate::core::relay::{Relay, RelayStatus};

/// Builds the axum router: the WebSocket endpoint at `ws_path`, `/health`
/// and `/status`.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn relay_router(relay: Arc<Relay>, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(relay)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    let limit = relay.max_message_bytes();
    ws.max_message_size(limit)
        .on_upgrade(move |socket| serve_client(socket, relay, Some(addr)))
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(relay): State<Arc<Relay>>) -> Json<RelayStatus> {
    Json(relay.status())
}

/// Runs one client session to completion.
pub async fn serve_client(socket: WebSocket, relay: Arc<Relay>, peer: Option<SocketAddr>) {
    let sessions = Arc::clone(relay.sessions());
    let (conn, mut outbound) = ClientConnection::new(peer);
    let id = conn.id();

    if let Err(e) = sessions.on_open(conn.clone()).await {
        tracing::error!(client_id = id, error = %e, "client rejected");
        return;
    }

    let (mut sink, mut stream) = socket.split();

    let writer_sessions = Arc::clone(&sessions);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let (msg, closing) = match frame {
                OutboundFrame::Text(text) => (Message::Text(text.to_string().into()), false),
                OutboundFrame::Close => (Message::Close(None), true),
            };
            if let Err(e) = sink.send(msg).await {
                writer_sessions.on_error(id, &e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                sessions.on_message(&conn, Arc::from(text.as_str()));
            }
            Ok(Message::Binary(data)) => {
                tracing::debug!(client_id = id, bytes = data.len(), "ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                sessions.on_error(id, &e);
                break;
            }
        }
    }

    sessions.on_close(id).await;
    writer.abort();
}
