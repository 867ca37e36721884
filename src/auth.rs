//! Agent authentication.
//!
//! The agent authenticates with the first frame it sends after the WebSocket
//! upgrade: a flat JSON object `{"type": "auth", "token": "..."}`. The frame
//! is deliberately outside the envelope format so an agent can authenticate
//! before it knows its tunnel id. Until the handshake succeeds, no request
//! traffic is forwarded over the connection.

use serde::Deserialize;

/// Wire error code sent when the handshake fails or times out.
pub const CODE_AUTH_REQUIRED: &str = "AUTH_REQUIRED";

#[derive(Debug, Deserialize)]
struct AuthFrame {
    #[serde(rename = "type")]
    frame_type: String,
    token: Option<String>,
}

/// Extract the token from a handshake frame. Returns `None` for anything
/// that is not a well-formed `{"type": "auth", ...}` object, so the caller
/// can keep waiting for the real handshake frame.
pub fn parse_auth_frame(raw: &str) -> Option<String> {
    let frame: AuthFrame = serde_json::from_str(raw).ok()?;
    if frame.frame_type != "auth" {
        return None;
    }
    frame.token
}

/// Check a presented token against the configured one.
pub fn validate_token(expected: &str, provided: &str) -> bool {
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected token length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_parse_auth_frame() {
        assert_eq!(
            parse_auth_frame(r#"{"type": "auth", "token": "tok-1"}"#),
            Some("tok-1".to_string())
        );
        // wrong type
        assert_eq!(parse_auth_frame(r#"{"type": "ping"}"#), None);
        // auth without a token
        assert_eq!(parse_auth_frame(r#"{"type": "auth"}"#), None);
        // not JSON at all
        assert_eq!(parse_auth_frame("hello"), None);
        // envelope-shaped frames are not handshakes
        assert_eq!(
            parse_auth_frame(r#"{"envelope": {}, "message": {}}"#),
            None
        );
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token("change-me", "change-me"));
        assert!(!validate_token("change-me", "change-m"));
    }
}
