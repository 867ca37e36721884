//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health` — liveness probe.
///
/// Returns status, uptime, version, agent connectivity, and the number of
/// in-flight proxied requests. Suitable for load-balancer health checks; the
/// broker is "ok" even with no agent connected, since the tunnel endpoint
/// itself is up.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "agent_connected": state.session.agent().is_some(),
        "pending_requests": state.session.pending().len(),
    }))
}
