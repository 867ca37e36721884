//! HTTP route handlers.
//!
//! The broker claims `/health`, `/status`, `/metrics`, and the tunnel
//! upgrade; everything else falls through to [`intake::proxy`], which
//! forwards the request over the tunnel.

pub mod health;
pub mod intake;
pub mod status;
