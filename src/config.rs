//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNNELD_AUTH_TOKEN`, `TUNNELD_LISTEN`,
//!    `TUNNELD_REQUEST_TIMEOUT_MS`
//! 2. **Config file** — path via `--config <path>`, or `tunneld.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [proxy]
//! request_timeout_ms = 30000
//! max_message_size = 16777216   # 16 MiB
//! max_buffered_bytes = 65536    # 64 KiB outbound buffer before shedding
//!
//! [protocol]
//! version = "1.0.0"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared agent token. Override with `TUNNELD_AUTH_TOKEN` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Proxying limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// How long a forwarded request may wait for the agent's response, in
    /// milliseconds (default 30 000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Maximum WebSocket frame and HTTP request body size in bytes
    /// (default 16 MiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Outbound bytes queued toward the agent before new requests are shed
    /// with 502 (default 64 KiB). Control frames are exempt.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

/// Tunnel protocol settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Version string stamped into every outbound message's metadata
    /// (default `1.0.0`).
    #[serde(default = "default_protocol_version")]
    pub version: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_token() -> String {
    "change-me".to_string()
}
fn default_request_timeout_ms() -> u64 {
    30000
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MiB
}
fn default_max_buffered_bytes() -> usize {
    64 * 1024
}
fn default_protocol_version() -> String {
    "1.0.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            max_message_size: default_max_message_size(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: default_protocol_version(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            proxy: ProxyConfig::default(),
            protocol: ProtocolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `tunneld.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunneld.toml").exists() {
            let content =
                std::fs::read_to_string("tunneld.toml").expect("Failed to read tunneld.toml");
            toml::from_str(&content).expect("Failed to parse tunneld.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(token) = std::env::var("TUNNELD_AUTH_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(listen) = std::env::var("TUNNELD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(timeout) = std::env::var("TUNNELD_REQUEST_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => config.proxy.request_timeout_ms = ms,
                Err(_) => eprintln!("Ignoring non-numeric TUNNELD_REQUEST_TIMEOUT_MS={timeout}"),
            }
        }

        config
    }

    /// Whether the broker is still running with the compiled-in token.
    pub fn uses_default_token(&self) -> bool {
        self.auth.token == default_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.auth.token, "change-me");
        assert_eq!(config.proxy.request_timeout_ms, 30000);
        assert_eq!(config.proxy.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.proxy.max_buffered_bytes, 64 * 1024);
        assert_eq!(config.protocol.version, "1.0.0");
        assert_eq!(config.logging.level, "info");
        assert!(config.uses_default_token());
    }

    #[test]
    fn test_partial_toml_keeps_defaults_elsewhere() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            token = "s3cret"

            [proxy]
            request_timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.token, "s3cret");
        assert_eq!(config.proxy.request_timeout_ms, 5000);
        // untouched sections fall back
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.proxy.max_message_size, 16 * 1024 * 1024);
        assert!(!config.uses_default_token());
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.auth.token, "change-me");
        assert_eq!(config.protocol.version, "1.0.0");
    }
}
