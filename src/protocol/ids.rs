//! Prefixed hex identifiers for messages, requests, tunnels, and connections.
//!
//! Ids are `PREFIX` + 12 uppercase hex characters, derived by hashing a
//! timestamp with a random nonce. They are routing hints, not secrets — the
//! hash just keeps them short and uniform.

use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current wall clock as milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    // 6 bytes -> 12 hex chars
    digest[..6].iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02X}");
        acc
    })
}

fn generate(prefix: &str) -> String {
    let nonce = Uuid::new_v4();
    format!("{prefix}{}", hex_digest(&format!("{}{nonce}", now_ms())))
}

/// Fresh message id (`M0X…`).
pub fn message() -> String {
    generate("M0X")
}

/// Fresh request id (`R0X…`). Never reused: each call hashes a new nonce.
pub fn request() -> String {
    generate("R0X")
}

/// Fresh tunnel id (`T0X…`).
pub fn tunnel() -> String {
    generate("T0X")
}

/// Fresh connection id (`CONN…`).
pub fn connection() -> String {
    generate("CONN")
}

/// Client id derived deterministically from a message id (`C0X…`).
pub fn client_for(message_id: &str) -> String {
    format!("C0X{}", hex_digest(message_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_and_length() {
        assert!(message().starts_with("M0X"));
        assert!(request().starts_with("R0X"));
        assert!(tunnel().starts_with("T0X"));
        assert_eq!(message().len(), 3 + 12);
    }

    #[test]
    fn test_request_ids_unique() {
        let a = request();
        let b = request();
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_id_deterministic() {
        let mid = "M0XABCDEF012345";
        assert_eq!(client_for(mid), client_for(mid));
        assert!(client_for(mid).starts_with("C0X"));
    }

    #[test]
    fn test_hex_is_uppercase() {
        let id = request();
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
