//! # Viewer WebSocket Server
//!
//! This module implements the WebSocket endpoint that web viewers connect to.
//! Each accepted socket is registered with the [`BroadcastHub`] and receives
//! every `status` and `motion` message published afterwards.
//!
//! ## Endpoints
//!
//! | Path | Description |
//! |------|-------------|
//! | any | WebSocket upgrade; server → viewer JSON text frames |
//!
//! Viewers never send anything meaningful: text and binary frames from the
//! client are ignored, and a close frame or socket error ends the session.
//!
//! [`BroadcastHub`]: super::hub::BroadcastHub

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::hub::HubHandle;

/// Builds the viewer router. Every path accepts a WebSocket upgrade.
pub fn router(hub: HubHandle) -> Router {
    Router::new().fallback(handle_websocket).with_state(hub)
}

/// Serves viewer connections on an already bound listener until the process
/// exits.
///
/// # Errors
///
/// Returns the underlying I/O error if the accept loop fails.
pub async fn serve_viewers(listener: TcpListener, hub: HubHandle) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("WS    ws://{}", addr);
    }
    axum::serve(listener, router(hub)).await
}

/// Handles WebSocket upgrade requests.
async fn handle_websocket(ws: WebSocketUpgrade, State(hub): State<HubHandle>) -> Response {
    ws.on_upgrade(move |socket| handle_viewer_socket(socket, hub))
}

/// Manages a single viewer connection for its whole lifetime.
async fn handle_viewer_socket(mut socket: WebSocket, hub: HubHandle) {
    // Dropping `viewer` at the end of this function unregisters it.
    let mut viewer = hub.connect();
    debug!(viewer = viewer.id(), "Viewer socket opened");

    loop {
        tokio::select! {
            // Forward hub messages to the client
            frame = viewer.recv() => {
                let Some(frame) = frame else {
                    break; // Hub dropped this viewer or shut down
                };
                if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break; // Client disconnected
                }
            }
            // Handle client messages (ping/pong, close)
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {} // Ignore other messages
                }
            }
        }
    }

    debug!(viewer = viewer.id(), "Viewer socket closed");
}
