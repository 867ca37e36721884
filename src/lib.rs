#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunneld library — reverse-tunnel broker building blocks.
//!
//! - `protocol` — envelope codec, body transcoding, id generation
//! - `tunnel` — agent admission, request correlation, session dispatch
//! - `auth` — handshake parsing, constant-time token comparison
//! - `config` — TOML + env-var configuration
//! - `routes` — health/status endpoints and the HTTP intake
//! - `ws` — agent WebSocket transport

pub mod auth;
pub mod config;
pub mod protocol;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
pub use tunnel::TunnelSession;
