//! Content-type-aware body transcoding between wire values and HTTP bodies.
//!
//! Transcoding is advisory: it must never abort request delivery. Every
//! branch is total — when a family-specific interpretation fails, the body
//! degrades to the text rendering and the returned [`Transcoded`] records the
//! fallback instead of surfacing an error.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

/// Content family a body is handled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFamily {
    Json,
    Text,
    Html,
    Xml,
    Binary,
}

impl BodyFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            BodyFamily::Json => "json",
            BodyFamily::Text => "text",
            BodyFamily::Html => "html",
            BodyFamily::Xml => "xml",
            BodyFamily::Binary => "binary",
        }
    }
}

/// An HTTP entity body ready to hand to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpBody {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
}

impl HttpBody {
    pub fn is_empty(&self) -> bool {
        match self {
            HttpBody::Empty => true,
            HttpBody::Text(s) => s.is_empty(),
            HttpBody::Bytes(b) => b.is_empty(),
        }
    }
}

/// Result of a wire-to-HTTP transcode. `fell_back` is set when the declared
/// family could not interpret the value and the text rendering was used.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcoded {
    pub body: HttpBody,
    pub family: BodyFamily,
    pub fell_back: bool,
}

/// Extract the media type from a `content-type` header, case-insensitively,
/// with parameters (charset, boundary) stripped.
pub fn content_type(headers: &HashMap<String, String>) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty())
}

/// Exact content-type table, checked before any heuristic.
fn exact_family(content_type: &str) -> Option<BodyFamily> {
    match content_type {
        "application/json" | "text/json" | "application/ld+json" => Some(BodyFamily::Json),
        "text/plain" | "text/css" | "text/csv" | "text/javascript" => Some(BodyFamily::Text),
        "text/html" | "application/xhtml+xml" => Some(BodyFamily::Html),
        "application/xml" | "text/xml" | "application/soap+xml" | "application/rss+xml"
        | "application/atom+xml" => Some(BodyFamily::Xml),
        "application/octet-stream" | "application/pdf" | "image/jpeg" | "image/png"
        | "image/gif" | "image/webp" | "audio/mpeg" | "video/mp4" | "application/zip"
        | "application/gzip" => Some(BodyFamily::Binary),
        _ => None,
    }
}

/// Classify a media type: exact table first, then suffix/prefix heuristics.
/// Absent or unknown types default to text.
pub fn family_for(content_type: Option<&str>) -> BodyFamily {
    let Some(ct) = content_type else {
        return BodyFamily::Text;
    };
    if let Some(family) = exact_family(ct) {
        return family;
    }
    if ct.contains("json") {
        return BodyFamily::Json;
    }
    if ct.contains("html") {
        return BodyFamily::Html;
    }
    if ct.contains("xml") {
        return BodyFamily::Xml;
    }
    if ct.starts_with("text/") {
        return BodyFamily::Text;
    }
    if ct.starts_with("image/") || ct.starts_with("audio/") || ct.starts_with("video/") {
        return BodyFamily::Binary;
    }
    if ct.starts_with("application/") {
        if ct.contains("text") || ct.contains("javascript") {
            return BodyFamily::Text;
        }
        return BodyFamily::Binary;
    }
    BodyFamily::Text
}

/// True when the value is a JSON array of integers in `0..=255`.
fn as_byte_array(value: &Value) -> Option<Vec<u8>> {
    let items = value.as_array()?;
    let mut bytes = Vec::with_capacity(items.len());
    for item in items {
        let n = item.as_u64()?;
        if n > 255 {
            return None;
        }
        bytes.push(n as u8);
    }
    Some(bytes)
}

/// Render any wire value as text. Total: lossy UTF-8 for byte arrays,
/// JSON serialization for structured values.
fn render_text(value: &Value) -> String {
    if let Some(bytes) = as_byte_array(value) {
        return String::from_utf8_lossy(&bytes).into_owned();
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Convert a wire body into an HTTP entity per the declared content type.
/// Never fails: unreadable inputs degrade to the text rendering.
pub fn from_wire(body: Option<&Value>, headers: &HashMap<String, String>) -> Transcoded {
    let ct = content_type(headers);
    let family = family_for(ct.as_deref());

    let Some(value) = body else {
        return Transcoded {
            body: HttpBody::Empty,
            family,
            fell_back: false,
        };
    };
    if value.is_null() {
        return Transcoded {
            body: HttpBody::Empty,
            family,
            fell_back: false,
        };
    }

    match family {
        BodyFamily::Json => {
            // Best-effort readability: invalid JSON is still returned as the
            // decoded text, flagged as a fallback.
            let text = render_text(value);
            let valid = value.is_object()
                || value.is_array() && as_byte_array(value).is_none()
                || serde_json::from_str::<Value>(&text).is_ok();
            Transcoded {
                body: HttpBody::Text(text),
                family,
                fell_back: !valid,
            }
        }
        BodyFamily::Text | BodyFamily::Html | BodyFamily::Xml => Transcoded {
            body: HttpBody::Text(render_text(value)),
            family,
            fell_back: false,
        },
        BodyFamily::Binary => {
            if let Some(bytes) = as_byte_array(value) {
                return Transcoded {
                    body: HttpBody::Bytes(bytes),
                    family,
                    fell_back: false,
                };
            }
            match value {
                // Binary bodies travel base64-encoded; a plain string that is
                // not base64 is carried as its UTF-8 bytes.
                Value::String(s) => match BASE64.decode(s.as_bytes()) {
                    Ok(bytes) => Transcoded {
                        body: HttpBody::Bytes(bytes),
                        family,
                        fell_back: false,
                    },
                    Err(_) => Transcoded {
                        body: HttpBody::Bytes(s.clone().into_bytes()),
                        family,
                        fell_back: false,
                    },
                },
                // Structured inputs are JSON-stringified then byte-encoded.
                other => Transcoded {
                    body: HttpBody::Bytes(other.to_string().into_bytes()),
                    family,
                    fell_back: false,
                },
            }
        }
    }
}

/// Convert raw HTTP body bytes into their wire representation. Textual
/// families travel as (lossy) UTF-8 strings, binary as base64.
pub fn to_wire(raw: &[u8], headers: &HashMap<String, String>) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    let ct = content_type(headers);
    match family_for(ct.as_deref()) {
        BodyFamily::Binary => Value::String(BASE64.encode(raw)),
        _ => Value::String(String::from_utf8_lossy(raw).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_ct(ct: &str) -> HashMap<String, String> {
        let mut h = HashMap::new();
        h.insert("Content-Type".to_string(), ct.to_string());
        h
    }

    #[test]
    fn test_content_type_case_insensitive_and_stripped() {
        let mut h = HashMap::new();
        h.insert(
            "CONTENT-TYPE".to_string(),
            "Application/JSON; charset=utf-8".to_string(),
        );
        assert_eq!(content_type(&h).as_deref(), Some("application/json"));
    }

    #[test]
    fn test_family_exact_table() {
        assert_eq!(family_for(Some("application/json")), BodyFamily::Json);
        assert_eq!(family_for(Some("text/html")), BodyFamily::Html);
        assert_eq!(family_for(Some("application/soap+xml")), BodyFamily::Xml);
        assert_eq!(family_for(Some("application/pdf")), BodyFamily::Binary);
        assert_eq!(family_for(Some("text/csv")), BodyFamily::Text);
    }

    #[test]
    fn test_family_heuristics() {
        assert_eq!(family_for(Some("application/vnd.api+json")), BodyFamily::Json);
        assert_eq!(family_for(Some("image/svg+xml")), BodyFamily::Xml);
        assert_eq!(family_for(Some("text/markdown")), BodyFamily::Text);
        assert_eq!(family_for(Some("video/webm")), BodyFamily::Binary);
        assert_eq!(family_for(Some("application/x-javascript")), BodyFamily::Text);
        assert_eq!(family_for(Some("application/vnd.sqlite3")), BodyFamily::Binary);
        assert_eq!(family_for(Some("model/gltf+json")), BodyFamily::Json);
        assert_eq!(family_for(None), BodyFamily::Text);
    }

    #[test]
    fn test_from_wire_null_is_empty() {
        let t = from_wire(Some(&Value::Null), &with_ct("application/json"));
        assert_eq!(t.body, HttpBody::Empty);
        assert!(!t.fell_back);
    }

    #[test]
    fn test_from_wire_valid_json_string() {
        let v = json!(r#"{"a":1}"#);
        let t = from_wire(Some(&v), &with_ct("application/json"));
        assert_eq!(t.body, HttpBody::Text(r#"{"a":1}"#.to_string()));
        assert!(!t.fell_back);
    }

    #[test]
    fn test_from_wire_invalid_json_degrades_to_text() {
        let v = json!("{not valid json");
        let t = from_wire(Some(&v), &with_ct("application/json"));
        assert_eq!(t.body, HttpBody::Text("{not valid json".to_string()));
        assert!(t.fell_back);
    }

    #[test]
    fn test_from_wire_json_byte_array() {
        let v = json!([123, 34, 97, 34, 58, 49, 125]); // {"a":1}
        let t = from_wire(Some(&v), &with_ct("application/json"));
        assert_eq!(t.body, HttpBody::Text(r#"{"a":1}"#.to_string()));
        assert!(!t.fell_back);
    }

    #[test]
    fn test_from_wire_json_object_is_stringified() {
        let v = json!({"a": 1});
        let t = from_wire(Some(&v), &with_ct("application/json"));
        assert_eq!(t.body, HttpBody::Text(r#"{"a":1}"#.to_string()));
        assert!(!t.fell_back);
    }

    #[test]
    fn test_from_wire_binary_base64_round_trip() {
        let raw: &[u8] = &[0, 159, 146, 150, 255];
        let headers = with_ct("application/octet-stream");
        let wire = to_wire(raw, &headers);
        let t = from_wire(Some(&wire), &headers);
        assert_eq!(t.body, HttpBody::Bytes(raw.to_vec()));
    }

    #[test]
    fn test_from_wire_binary_byte_array() {
        let v = json!([1, 2, 3]);
        let t = from_wire(Some(&v), &with_ct("image/png"));
        assert_eq!(t.body, HttpBody::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_from_wire_binary_object_stringified_to_bytes() {
        let v = json!({"a": 1});
        let t = from_wire(Some(&v), &with_ct("application/octet-stream"));
        assert_eq!(t.body, HttpBody::Bytes(br#"{"a":1}"#.to_vec()));
    }

    #[test]
    fn test_from_wire_never_panics_on_odd_inputs() {
        let headers = [
            with_ct("application/json"),
            with_ct("application/octet-stream"),
            with_ct("text/plain"),
            HashMap::new(),
        ];
        let values = [
            json!(null),
            json!(true),
            json!(12.5),
            json!([1, 2, 999]), // not a byte array
            json!([[1], {"x": 2}]),
            json!("plain"),
            json!({"deep": {"nested": [1, "two"]}}),
        ];
        for h in &headers {
            for v in &values {
                let _ = from_wire(Some(v), h);
            }
            let _ = from_wire(None, h);
        }
    }

    #[test]
    fn test_to_wire_text_lossy() {
        let t = to_wire(&[0xff, 0x68, 0x69], &with_ct("text/plain"));
        assert_eq!(t, json!("\u{fffd}hi"));
    }

    #[test]
    fn test_to_wire_empty_is_null() {
        assert_eq!(to_wire(&[], &HashMap::new()), Value::Null);
    }
}
