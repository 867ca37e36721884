//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::config::Config;
use crate::tunnel::TunnelSession;

/// Shared application state for the tunneld broker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the broker started (for uptime calculation).
    pub start_time: Instant,
    /// Tunnel session: agent admission, correlation table, counters.
    pub session: Arc<TunnelSession>,
    /// Fired once on SIGINT/SIGTERM; the agent WebSocket loop selects on it
    /// so the shutdown notice reaches the agent before the socket closes.
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let session = Arc::new(TunnelSession::new(config.protocol.version.clone()));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            session,
            shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_broadcast_reaches_subscribers() {
        let state = AppState::new(Config::default());
        let mut rx = state.shutdown.subscribe();
        state.shutdown.send(()).unwrap();
        assert!(rx.recv().await.is_ok());
    }
}
