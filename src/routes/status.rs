//! Broker status and counters.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /status` — full broker snapshot: agent connection details, uptime,
/// and per-terminal-state request counters. Same shape as the
/// `status_response` control reply sent over the tunnel.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.session.status_report())
}

/// `GET /metrics` — flat counter view for scraping.
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let stats = state.session.pending().stats();
    Json(json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "agent_connected": u8::from(state.session.agent().is_some()),
        "requests_pending": stats.pending,
        "requests_created": stats.created,
        "requests_responded": stats.responded,
        "requests_timed_out": stats.timed_out,
        "requests_aborted": stats.aborted,
        "requests_unavailable": stats.unavailable,
    }))
}
