//! WebSocket transport for the agent tunnel.
//!
//! ## Connection lifecycle
//!
//! 1. The agent connects to `GET /tunnel/ws`. Admission happens immediately
//!    after the upgrade: if a live agent already holds the slot, the candidate
//!    receives a `CLIENT_ALREADY_CONNECTED` error frame and is closed after a
//!    short grace delay. The incumbent is untouched.
//! 2. The first meaningful frame must be the flat handshake
//!    `{"type": "auth", "token": "..."}`. Anything else is dropped while the
//!    handshake deadline runs; a wrong token or a missed deadline ends the
//!    connection with `AUTH_REQUIRED`.
//! 3. After `{"status": "authenticated"}` is sent back, all traffic uses the
//!    envelope format (`envelope` + `message`) and is dispatched by
//!    [`TunnelSession::on_inbound_message`]. Malformed frames draw error
//!    replies but never terminate the session.
//! 4. On broker shutdown the loop receives the process-wide shutdown signal,
//!    sends a `SERVER_SHUTDOWN` notice, and closes the socket so graceful
//!    shutdown is not held open by the tunnel.
//! 5. On disconnect the admission slot is released. In-flight proxied
//!    requests are NOT swept; they finish through their own timeouts.
//!
//! [`TunnelSession::on_inbound_message`]: crate::tunnel::TunnelSession::on_inbound_message

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{self, CODE_AUTH_REQUIRED};
use crate::protocol::codec;
use crate::tunnel::{AgentConnection, Admission};
use crate::AppState;

/// Wire error code in the shutdown notice to a connected agent.
const CODE_SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";

/// How long a freshly upgraded connection may take to present the handshake.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// Delay between queueing a terminal error frame and tearing the socket down,
/// so the frame actually reaches the agent.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// `GET /tunnel/ws` — agent tunnel upgrade handler.
///
/// The frame size cap is applied at the transport; authentication happens
/// in-band on the first frame, not at upgrade time.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(state.config.proxy.max_message_size)
        .on_upgrade(move |socket| handle_agent_ws(socket, state))
}

/// Main agent connection loop: admission, handshake, then frame dispatch.
async fn handle_agent_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outgoing frames funnel through a channel so the intake handlers can
    // forward without touching the socket.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let conn = Arc::new(AgentConnection::new(tx, state.config.proxy.max_buffered_bytes));
    let version = state.session.version().to_string();

    // Task: drain the channel into the WebSocket sink, keeping the
    // buffered-bytes gauge honest.
    let writer_conn = conn.clone();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let len = frame.len();
            let result = ws_sink.send(Message::Text(frame.into())).await;
            writer_conn.note_flushed(len);
            if result.is_err() {
                break;
            }
        }
    });

    match state.session.guard().admit(conn.clone()) {
        Admission::Granted => {
            info!(
                connection_id = %conn.connection_id,
                tunnel_id = %conn.tunnel_id,
                "agent connection admitted"
            );
        }
        Admission::Rejected { code, reason } => {
            conn.send_message(&codec::error_message(&reason, code, None, &version));
            tokio::time::sleep(CLOSE_GRACE).await;
            send_task.abort();
            return;
        }
    }

    // Handshake phase. Frames other than a well-formed auth object are
    // dropped until the deadline expires.
    let deadline = tokio::time::Instant::now() + AUTH_DEADLINE;
    let authenticated = loop {
        match tokio::time::timeout_at(deadline, ws_stream.next()).await {
            Err(_) => {
                warn!(connection_id = %conn.connection_id, "handshake deadline expired");
                break false;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break false,
            Ok(Some(Ok(Message::Text(text)))) => {
                let Some(token) = auth::parse_auth_frame(&text) else {
                    debug!(connection_id = %conn.connection_id, "pre-auth frame dropped");
                    continue;
                };
                break auth::validate_token(&state.config.auth.token, &token);
            }
            Ok(Some(Ok(_))) => continue,
        }
    };

    if !authenticated {
        warn!(connection_id = %conn.connection_id, "agent failed authentication");
        conn.send_message(&codec::error_message(
            "Authentication required",
            CODE_AUTH_REQUIRED,
            None,
            &version,
        ));
        tokio::time::sleep(CLOSE_GRACE).await;
        state.session.guard().release(&conn);
        send_task.abort();
        return;
    }

    conn.authenticated.store(true, Ordering::Relaxed);
    conn.send_message(&codec::auth_message(
        "authenticated",
        "Authentication successful",
        &version,
    ));
    info!(
        connection_id = %conn.connection_id,
        tunnel_id = %conn.tunnel_id,
        "agent authenticated, tunnel open"
    );

    // Dispatch loop. Errors inside a frame draw a reply; only transport-level
    // failure, a close frame, or broker shutdown ends the session.
    let mut shutdown_rx = state.shutdown.subscribe();
    let span = info_span!("agent_ws", connection_id = %conn.connection_id);
    async {
        loop {
            tokio::select! {
                ws_msg = ws_stream.next() => {
                    let Some(Ok(msg)) = ws_msg else { break };
                    match msg {
                        Message::Text(text) => {
                            if let Some(reply) = state.session.on_inbound_message(&text) {
                                conn.send_message(&reply);
                            }
                        }
                        Message::Binary(_) => {
                            conn.send_message(&state.session.on_inbound_binary());
                        }
                        Message::Close(_) => break,
                        // Ping/pong frames are answered by the transport.
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    // Notify the agent, give the writer a moment to flush,
                    // then drop the socket so graceful shutdown can finish.
                    info!("broker shutting down, notifying agent");
                    conn.send_message(&codec::error_message(
                        "Server shutting down",
                        CODE_SERVER_SHUTDOWN,
                        None,
                        &version,
                    ));
                    tokio::time::sleep(CLOSE_GRACE).await;
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await;

    if state.session.guard().release(&conn) {
        info!(
            connection_id = %conn.connection_id,
            pending = state.session.pending().len(),
            "agent disconnected, slot released"
        );
    }
    send_task.abort();
}
