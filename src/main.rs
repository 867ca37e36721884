#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunneld
//!
//! Reverse-tunnel broker: exposes a public HTTP endpoint and forwards every
//! unmatched request over a single persistent WebSocket to one private agent,
//! which serves it from inside its own network and streams the response back.
//!
//! ## API surface
//!
//! | Method | Path         | Description                                    |
//! |--------|--------------|------------------------------------------------|
//! | GET    | `/health`    | Liveness probe                                 |
//! | GET    | `/status`    | Broker snapshot: agent, counters, uptime       |
//! | GET    | `/metrics`   | Flat counter view                              |
//! | GET    | `/tunnel/ws` | Agent WebSocket (auth via first frame)         |
//! | *      | `/*`         | Proxied to the connected agent                 |
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, clap, router setup, graceful shutdown
//! config.rs     — TOML + env-var configuration
//! auth.rs       — handshake frame parsing, constant-time comparison
//! protocol/
//!   codec.rs    — envelope/message wire format, decode validation
//!   body.rs     — content-type driven body transcoding
//!   ids.rs      — hashed-nonce id generation
//! tunnel/
//!   admission.rs — single-active-connection guard
//!   pending.rs   — request correlation table, timeouts, abort guard
//!   session.rs   — agent connection, forwarding, inbound dispatch
//! routes/
//!   health.rs   — GET /health
//!   status.rs   — GET /status, GET /metrics
//!   intake.rs   — fallback proxy handler
//! ws/
//!   mod.rs      — upgrade, admission, handshake, frame loop
//! ```

use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tunneld::{routes, ws, AppState, Config};

/// Reverse-tunnel broker for serving HTTP from behind NAT.
#[derive(Parser)]
#[command(name = "tunneld", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            // Backward compat: no subcommand but --config may be passed
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_server(config_path.as_deref()).await;
        }
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunneld v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!(
        "Request timeout {}ms, frame limit {} bytes",
        config.proxy.request_timeout_ms, config.proxy.max_message_size
    );

    if config.uses_default_token() {
        warn!("Using default auth token — set TUNNELD_AUTH_TOKEN or update config");
    }

    let state = AppState::new(config);

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .route("/status", get(routes::status::status))
        .route("/metrics", get(routes::status::metrics))
        .route("/tunnel/ws", get(ws::ws_upgrade))
        .fallback(routes::intake::proxy)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Broker ready");

    // Graceful shutdown. The broadcast tells the agent WebSocket loop to send
    // its shutdown notice and close, so serve is not held open by the tunnel.
    let shutdown_tx = state.shutdown.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    info!("Goodbye");
}
