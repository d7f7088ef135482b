//! WebSocket handler for Axum
//!
//! Upgrades the HTTP request, authenticates it through the gateway and runs
//! the connection: a spawned delivery worker owns the write half while this
//! task reads control frames.

use std::borrow::Cow;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::StreamExt;
use livesync_shared::Identity;

use crate::error::AuthError;
use crate::state::AppState;

use super::connection::ConnectionState;
use super::gateway::{FrameOutcome, HandshakeParams, HandshakeRequest};
use super::worker::DeliveryWorker;

/// Time allowed for the worker to flush its final frames after the read side ends
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the peer to answer a server-initiated close
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket handler - upgrades the HTTP connection to a WebSocket.
///
/// Failed authentication still completes the upgrade so that the client can
/// read the close code; no connection is registered for it.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
) -> Response {
    let ws = ws.max_message_size(state.gateway.settings().max_message_bytes);
    let request = HandshakeRequest::from_parts(params, &headers);

    match state.gateway.authenticate(&request).await {
        Ok(identity) => {
            tracing::info!(user_id = %identity.user_id, role = %identity.role, "WebSocket connection upgrade requested");
            ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
        }
        Err(err) => {
            match &err {
                AuthError::Unavailable(reason) => {
                    tracing::error!(reason = %reason, "WebSocket auth failed: verifier unavailable")
                }
                other => tracing::warn!(error = %other, "WebSocket auth failed"),
            }
            ws.on_upgrade(move |socket| refuse(socket, err))
        }
    }
}

/// Close a freshly upgraded socket with the auth failure's close code
async fn refuse(mut socket: WebSocket, err: AuthError) {
    let frame = CloseFrame {
        code: err.close_code(),
        reason: Cow::Borrowed(err.close_reason()),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send handshake refusal");
        return;
    }
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = socket.recv().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    })
    .await;
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (sink, mut stream) = socket.split();

    let conn = state.gateway.open(identity);
    let connection_id = conn.id;

    let worker = DeliveryWorker::new(
        conn.clone(),
        state.registry.clone(),
        sink,
        state.gateway.settings(),
    );
    // The worker moves the connection to Open as it writes `authenticated`
    let mut send_task = tokio::spawn(worker.run());

    let mut worker_done = false;
    let mut peer_closed = false;
    loop {
        tokio::select! {
            exit = &mut send_task => {
                worker_done = true;
                tracing::debug!(connection_id = %connection_id, exit = ?exit.ok(), "Delivery worker ended first");
                break;
            }
            msg = stream.next() => {
                let outcome = match msg {
                    Some(Ok(Message::Text(text))) => state.gateway.handle_text(&conn, &text),
                    Some(Ok(Message::Binary(_))) => state.gateway.handle_binary(&conn),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Axum answers pings itself; any frame counts as activity
                        conn.touch();
                        FrameOutcome::Continue
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(connection_id = %connection_id, "WebSocket close frame received");
                        peer_closed = true;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                        peer_closed = true;
                        break;
                    }
                    None => {
                        peer_closed = true;
                        break;
                    }
                };
                if outcome == FrameOutcome::Close {
                    break;
                }
            }
        }
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = %conn.user_id(),
        connected_secs = conn.connected_at.elapsed().as_secs(),
        "WebSocket connection closing"
    );
    state.gateway.disconnect(&conn);

    if !worker_done && tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
        send_task.abort();
    }

    // Server-initiated close: let the peer answer before the socket drops
    if !peer_closed {
        let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Close(_) = message {
                    break;
                }
            }
        })
        .await;
    }
    conn.advance(ConnectionState::Closed);
}
