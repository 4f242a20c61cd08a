// src/web.rs
use crate::config::DEFAULT_PORT;
use crate::error::SessionError;
use crate::event::ServerMessage;
use crate::room::Room;
use crate::self_version::{CLIENT_SCRIPT_NAME, EMBEDDED_CLIENT_SCRIPT};
use crate::session::{Handshake, Session};
use crate::watch_session::WatchSession;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc::Receiver as MpscReceiver, watch::Receiver as WatchReceiver};
use tracing::{debug, error, info, warn};

/// Shared state for the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    /// The watched root sessions resolve against.
    pub watch: Arc<WatchSession>,
    /// Directory served by the static handler.
    pub public_dir: PathBuf,
    /// Port the server is reachable on; substituted into served scripts.
    pub port: u16,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::PageNotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::InvalidRoom(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Handles incoming WebSocket upgrade requests.
///
/// The requested page is resolved before upgrading; if it cannot be found
/// the upgrade is refused with an HTTP error.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match Session::connect(Arc::clone(&state.watch), &handshake) {
        Ok((session, outbound)) => {
            ws.on_upgrade(move |socket| handle_socket(socket, session, outbound))
        }
        Err(e) => {
            warn!("Refusing connection for {:?}: {}", handshake.path, e);
            e.into_response()
        }
    }
}

/// Handles a single WebSocket client connection.
///
/// Spawns two tasks:
/// - One draining the session's queue and sending messages as JSON.
/// - One applying `watch-asset` requests from the client.
///
/// The connection is closed when either task finishes; the session (and its
/// subscriptions) goes away with the receive task.
async fn handle_socket(socket: WebSocket, session: Session, mut outbound: MpscReceiver<ServerMessage>) {
    let session_id = session.id();
    let (mut sender, mut receiver): (SplitSink<WebSocket, Message>, SplitStream<WebSocket>) =
        socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json_payload) => {
                    if sender.send(Message::Text(json_payload)).await.is_err() {
                        debug!("Failed to send to session {}, client disconnected?", session_id);
                        break;
                    }
                    debug!("Sent {} to session {}", msg.name(), session_id);
                }
                Err(e) => {
                    error!("Failed to serialize {} for WebSocket: {}", msg.name(), e);
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(t) => session.handle_text(&t),
                Message::Close(_) => {
                    debug!("Session {} sent Close frame.", session.id());
                    break;
                }
                // Axum answers pings itself.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Guesses a content type from the file extension.
fn content_type(room: &Room) -> &'static str {
    match room.extension().as_deref() {
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Replaces every literal occurrence of the compiled-in default port with
/// the configured one.
pub fn rewrite_port(script: &str, port: u16) -> String {
    script.replace(&DEFAULT_PORT.to_string(), &port.to_string())
}

/// Serves files from the public directory. Scripts get the default port
/// rewritten; the client script falls back to the embedded copy.
async fn serve_static(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    let room = match Room::new(uri.path().trim_start_matches('/')) {
        Ok(room) => room,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let body = match tokio::fs::read(state.public_dir.join(room.as_str())).await {
        Ok(bytes) => bytes,
        Err(_) if room.as_str() == CLIENT_SCRIPT_NAME => EMBEDDED_CLIENT_SCRIPT.as_bytes().to_vec(),
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let body = if room.extension().as_deref() == Some("js") {
        rewrite_port(&String::from_utf8_lossy(&body), state.port).into_bytes()
    } else {
        body
    };

    (
        [
            (header::CONTENT_TYPE, content_type(&room)),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body,
    )
        .into_response()
}

/// Builds the HTTP router: `/ws` for sessions, everything else static.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .fallback(serve_static)
        .with_state(Arc::new(state))
}

/// Serves `state` on an already bound listener until `shutdown_signal` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    let app = router(state);

    info!("Server listening on http://{}", local_addr);

    let mut shutdown = shutdown_signal.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Web server shutting down gracefully.");
    })
    .await?;

    info!("Web server stopped.");
    Ok(())
}

/// Binds `addr` and serves until shutdown.
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown_signal).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_every_default_port_literal() {
        let script = "const PORT = 3008; fetch(`http://x:3008/ws`);";
        assert_eq!(
            rewrite_port(script, 4000),
            "const PORT = 4000; fetch(`http://x:4000/ws`);"
        );
        assert_eq!(rewrite_port(script, DEFAULT_PORT), script);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(&Room::new("reloader.js").unwrap()), "text/javascript; charset=utf-8");
        assert_eq!(content_type(&Room::new("img/logo.PNG").unwrap()), "image/png");
        assert_eq!(content_type(&Room::new("data.bin").unwrap()), "application/octet-stream");
    }
}
