//! Tunnel session: the broker-side owner of the single agent connection and
//! the request correlation table.
//!
//! The HTTP intake layer calls [`TunnelSession::forward`] to push a request
//! down the tunnel; the WebSocket layer feeds every inbound agent frame
//! through [`TunnelSession::on_inbound_message`] and sends back whatever
//! reply it returns. Neither path holds a lock across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::body;
use crate::protocol::codec::{
    self, ControlPayload, HttpPayload, MessageType, Payload, TunnelMessage,
};
use crate::protocol::ids;

use super::admission::{AdmissionGuard, LivenessProbe};
use super::pending::{Outcome, PendingTable, RequestStatus, Resolution};

/// Wire error code for unrecognized message/payload combinations.
pub const CODE_UNKNOWN_TUNNEL_TYPE: &str = "UNKNOWN_TUNNEL_TYPE";
/// Wire error code for bare text frames other than `PING`.
pub const CODE_TEXT_NOT_SUPPORTED: &str = "TEXT_NOT_SUPPORTED";
/// Wire error code for binary transport frames; the tunnel is JSON text only.
pub const CODE_BINARY_NOT_SUPPORTED: &str = "BINARY_NOT_SUPPORTED";

/// The single active agent socket, as seen by the session. Frames are queued
/// on a bounded channel drained by the WebSocket writer task.
pub struct AgentConnection {
    pub connection_id: String,
    pub tunnel_id: String,
    pub connected_at: Instant,
    /// Set once the auth handshake succeeds; only an authenticated connection
    /// is eligible for request forwarding.
    pub authenticated: AtomicBool,
    outbound: mpsc::Sender<String>,
    buffered_bytes: AtomicUsize,
    max_buffered_bytes: usize,
}

impl AgentConnection {
    pub fn new(outbound: mpsc::Sender<String>, max_buffered_bytes: usize) -> Self {
        Self {
            connection_id: ids::connection(),
            tunnel_id: ids::tunnel(),
            connected_at: Instant::now(),
            authenticated: AtomicBool::new(false),
            outbound,
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes,
        }
    }

    fn enqueue(&self, frame: String, enforce_limit: bool) -> bool {
        let len = frame.len();
        if enforce_limit {
            // Gate on what is already queued, not on the candidate frame: a
            // frame larger than the threshold must still go through once the
            // writer has drained. The transport frame cap is the per-frame
            // limit.
            let buffered = self.buffered_bytes.load(Ordering::Relaxed);
            if buffered > self.max_buffered_bytes {
                warn!(
                    connection_id = %self.connection_id,
                    buffered,
                    "outbound buffer over threshold, shedding request"
                );
                return false;
            }
        }
        self.buffered_bytes.fetch_add(len, Ordering::Relaxed);
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.buffered_bytes.fetch_sub(len, Ordering::Relaxed);
                false
            }
        }
    }

    /// Queue a control frame. Control and auth traffic bypasses the
    /// backpressure threshold so the agent stays reachable under load.
    pub fn send_message(&self, msg: &TunnelMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(frame) => self.enqueue(frame, false),
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "failed to serialize frame");
                false
            }
        }
    }

    /// Queue a forwarded request frame, subject to the buffered-bytes cap.
    pub fn send_request_frame(&self, frame: String) -> bool {
        self.enqueue(frame, true)
    }

    /// Called by the writer task after a frame reaches the socket.
    pub fn note_flushed(&self, len: usize) {
        self.buffered_bytes.fetch_sub(len, Ordering::Relaxed);
    }

    pub fn buffered(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }
}

impl LivenessProbe for AgentConnection {
    fn is_alive(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Per-process tunnel state: admission guard, correlation table, counters.
pub struct TunnelSession {
    guard: AdmissionGuard<AgentConnection>,
    pending: PendingTable,
    version: String,
    forwarded: AtomicU64,
    started_at: Instant,
}

impl TunnelSession {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            guard: AdmissionGuard::new(),
            pending: PendingTable::new(),
            version: version.into(),
            forwarded: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn guard(&self) -> &AdmissionGuard<AgentConnection> {
        &self.guard
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The connection usable for forwarding: recorded, authenticated, alive.
    pub fn agent(&self) -> Option<Arc<AgentConnection>> {
        self.guard
            .active()
            .filter(|c| c.is_authenticated() && c.is_alive())
    }

    /// Build and send an `http_request` frame for `request_id`.
    ///
    /// Returns false when no usable connection exists or backpressure sheds
    /// the frame — the caller must resolve the correlation entry with a
    /// 502-equivalent outcome and must not arm a timeout.
    pub fn forward(
        &self,
        request_id: &str,
        method: &str,
        url: &str,
        headers: HashMap<String, String>,
        body: Option<Value>,
    ) -> bool {
        let Some(conn) = self.agent() else {
            return false;
        };
        let msg = codec::http_request_message(method, url, headers, body, request_id, &self.version);
        let Ok(frame) = serde_json::to_string(&msg) else {
            return false;
        };
        if !conn.send_request_frame(frame) {
            return false;
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id,
            method,
            url,
            status = RequestStatus::Forwarded.as_str(),
            "request forwarded to agent"
        );
        true
    }

    /// Dispatch one inbound agent frame; the returned message, if any, is the
    /// reply to send back. Never terminates the session: malformed or
    /// unrecognized frames produce Control/Error replies and the loop
    /// continues.
    pub fn on_inbound_message(&self, raw: &str) -> Option<TunnelMessage> {
        let trimmed = raw.trim();
        // Degenerate non-JSON frames are recognized before decode.
        if !trimmed.starts_with('{') {
            if trimmed.eq_ignore_ascii_case("ping") {
                return Some(codec::pong_message(&self.version));
            }
            return Some(codec::error_message(
                "Plain text frames are not supported",
                CODE_TEXT_NOT_SUPPORTED,
                None,
                &self.version,
            ));
        }

        let msg = match codec::decode(trimmed) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable tunnel frame");
                return Some(codec::error_message(
                    &e.to_string(),
                    e.wire_code(),
                    None,
                    &self.version,
                ));
            }
        };
        let inbound_id = msg.message.metadata.id;

        match (msg.message.metadata.message_type, msg.message.payload) {
            (
                MessageType::HttpResponse,
                Payload::Http(HttpPayload::Response {
                    status,
                    status_text,
                    headers,
                    body,
                    request_id,
                }),
            ) => {
                let outcome = if status >= 400 {
                    Outcome::Failure {
                        status,
                        message: if status_text.is_empty() {
                            "agent reported an error".to_string()
                        } else {
                            status_text
                        },
                    }
                } else {
                    let transcoded = body::from_wire(body.as_ref(), &headers);
                    if transcoded.fell_back {
                        debug!(
                            request_id,
                            family = transcoded.family.as_str(),
                            "body fell back to text rendering"
                        );
                    }
                    Outcome::Success {
                        status,
                        headers,
                        body: transcoded.body,
                    }
                };
                match self.pending.resolve(&request_id, outcome) {
                    Resolution::Delivered => {
                        debug!(request_id, status, "agent response delivered");
                    }
                    Resolution::NotFound => {
                        warn!(
                            request_id,
                            "response arrived for timed-out or unknown request (dropped)"
                        );
                    }
                }
                None
            }
            (
                MessageType::Error,
                Payload::Control(ControlPayload::Error {
                    error,
                    code,
                    request_id: Some(request_id),
                    ..
                }),
            ) => {
                let outcome = Outcome::Failure {
                    status: 502,
                    message: error,
                };
                if self.pending.resolve(&request_id, outcome) == Resolution::NotFound {
                    warn!(
                        request_id,
                        code, "error arrived for timed-out or unknown request (dropped)"
                    );
                }
                None
            }
            (MessageType::Error, Payload::Control(ControlPayload::Error { error, code, .. })) => {
                // Agent-level error with no request to charge it to.
                warn!(code, error, "agent reported a connection-level error");
                None
            }
            (MessageType::Ping, _) => Some(codec::pong_message(&self.version)),
            (MessageType::Pong, _) => None,
            (MessageType::Auth, _) => {
                // Handshake already completed; repeated auth frames are inert.
                debug!("auth frame on an established connection ignored");
                None
            }
            (MessageType::StatusQuery, Payload::Control(ControlPayload::StatusQuery)) => {
                Some(codec::status_report_message(
                    self.status_report(),
                    Some(inbound_id),
                    &self.version,
                ))
            }
            (message_type, _) => {
                warn!(?message_type, "unrecognized tunnel message combination");
                Some(codec::error_message(
                    "Unrecognized tunnel message",
                    CODE_UNKNOWN_TUNNEL_TYPE,
                    None,
                    &self.version,
                ))
            }
        }
    }

    /// Reply for a binary transport frame. Every tunnel frame is JSON text;
    /// binary gets its own code so an agent can tell it apart from a
    /// malformed text frame.
    pub fn on_inbound_binary(&self) -> TunnelMessage {
        codec::error_message(
            "Binary frames are not supported",
            CODE_BINARY_NOT_SUPPORTED,
            None,
            &self.version,
        )
    }

    /// In-memory broker snapshot, served on `/status` and as the
    /// `status_response` control reply.
    pub fn status_report(&self) -> Value {
        let stats = self.pending.stats();
        let agent = self.guard.active().map(|conn| {
            json!({
                "connection_id": conn.connection_id,
                "tunnel_id": conn.tunnel_id,
                "authenticated": conn.is_authenticated(),
                "connected_secs": conn.connected_at.elapsed().as_secs(),
                "buffered_bytes": conn.buffered(),
            })
        });
        json!({
            "connected": self.agent().is_some(),
            "agent": agent,
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "version": self.version,
            "requests": {
                "pending": stats.pending,
                "created": stats.created,
                "forwarded": self.forwarded.load(Ordering::Relaxed),
                "responded": stats.responded,
                "timed_out": stats.timed_out,
                "aborted": stats.aborted,
                "unavailable": stats.unavailable,
            },
        })
    }
}
