//! HTTP intake: the fallback handler that turns any unmatched request into a
//! tunnel frame and waits for the correlated outcome.
//!
//! Lifecycle per request: mint an id, register a correlation entry, forward
//! over the tunnel, arm the deadline, then await exactly one terminal outcome
//! (response, failure, timeout, unavailable). If the HTTP client disconnects
//! mid-wait, the dropped [`AbortGuard`] frees the entry instead.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::body::{self as body_codec, HttpBody};
use crate::protocol::ids;
use crate::tunnel::{AbortGuard, Outcome};
use crate::AppState;

/// Headers the HTTP stack supplies itself; echoing the agent's copies would
/// conflict with the actual framing of the broker's response.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "date",
    "content-length",
    "connection",
    "server",
    "transfer-encoding",
];

/// Fallback handler for every route not claimed by the broker itself.
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().as_str().to_string();
    let url = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let headers = wire_headers(request.headers());

    let limit = state.config.proxy.max_message_size;
    let bytes = match to_bytes(request.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(method, url, error = %e, "request body rejected");
            return if is_length_limit(&e) {
                error_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Payload Too Large",
                    "Request body exceeds the tunnel frame limit",
                )
            } else {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "Bad Request",
                    "Request body could not be read",
                )
            };
        }
    };
    let wire_body = if bytes.is_empty() {
        None
    } else {
        Some(body_codec::to_wire(&bytes, &headers))
    };

    let request_id = ids::request();
    let (reply_tx, reply_rx) = oneshot::channel();
    if let Err(e) = state.session.pending().add(&request_id, reply_tx) {
        warn!(request_id, error = %e, "could not register request");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            "Request id collision",
        );
    }
    let mut guard = AbortGuard::new(state.session.pending().clone(), request_id.clone());
    debug!(request_id, method, url, "request registered");

    if state
        .session
        .forward(&request_id, &method, &url, headers, wire_body)
    {
        state.session.pending().schedule_timeout(
            &request_id,
            Duration::from_millis(state.config.proxy.request_timeout_ms),
        );
    } else {
        // Never forwarded: resolve immediately, no deadline to arm.
        state.session.pending().resolve(
            &request_id,
            Outcome::Unavailable {
                message: "No client connected to receive the request".to_string(),
            },
        );
    }

    let outcome = match reply_rx.await {
        Ok(outcome) => outcome,
        Err(_) => {
            // Sender dropped without resolving; should not happen.
            guard.disarm();
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Bad Gateway",
                "Tunnel request was dropped",
            );
        }
    };
    guard.disarm();
    outcome_response(&request_id, outcome)
}

/// Whether a body read failed on the configured size cap, as opposed to an
/// interrupted stream (client gone mid-body). Only the former is the
/// client's fault in the 413 sense.
fn is_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Lowercased header map for the wire; values that are not valid UTF-8 are
/// dropped rather than mangled.
fn wire_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn skip_response_header(name: &str) -> bool {
    SKIPPED_RESPONSE_HEADERS
        .iter()
        .any(|skipped| name.eq_ignore_ascii_case(skipped))
}

/// JSON error envelope used for every broker-originated failure.
fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    let payload = json!({
        "error": error,
        "message": message,
        "timestamp": ids::now_ms(),
    });
    let mut response = (status, axum::Json(payload)).into_response();
    response
        .headers_mut()
        .insert("x-tunnel-error", HeaderValue::from_static("1"));
    response
}

fn outcome_response(request_id: &str, outcome: Outcome) -> Response {
    match outcome {
        Outcome::Success {
            status,
            headers,
            body,
        } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let body = match body {
                HttpBody::Empty => Body::empty(),
                HttpBody::Text(text) => Body::from(text),
                HttpBody::Bytes(bytes) => Body::from(bytes),
            };
            let mut response = Response::new(body);
            *response.status_mut() = status;
            for (name, value) in &headers {
                if skip_response_header(name) {
                    continue;
                }
                let Ok(name) = HeaderName::try_from(name.as_str()) else {
                    continue;
                };
                let Ok(value) = HeaderValue::try_from(value.as_str()) else {
                    continue;
                };
                response.headers_mut().insert(name, value);
            }
            response
        }
        Outcome::Failure { status, message } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            error_response(
                status,
                status.canonical_reason().unwrap_or("Bad Gateway"),
                &message,
            )
        }
        Outcome::Timeout => {
            warn!(request_id, "answering 504, agent did not respond in time");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Gateway Timeout",
                "The connected client did not respond in time",
            )
        }
        Outcome::Unavailable { message } => {
            error_response(StatusCode::BAD_GATEWAY, "Bad Gateway", &message)
        }
        // The writer is gone; status code is never observed.
        Outcome::Aborted => StatusCode::BAD_GATEWAY.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_oversized_body_error_is_length_limited() {
        let err = to_bytes(Body::from(vec![0u8; 64]), 16).await.unwrap_err();
        assert!(is_length_limit(&err));
    }

    #[tokio::test]
    async fn test_interrupted_body_error_is_not_length_limited() {
        let broken = Body::from_stream(futures::stream::once(async {
            Err::<Vec<u8>, std::io::Error>(std::io::Error::other("connection reset"))
        }));
        let err = to_bytes(broken, 1024).await.unwrap_err();
        assert!(!is_length_limit(&err));
    }

    #[test]
    fn test_skip_response_header_is_case_insensitive() {
        assert!(skip_response_header("Date"));
        assert!(skip_response_header("CONTENT-LENGTH"));
        assert!(skip_response_header("transfer-encoding"));
        assert!(!skip_response_header("content-type"));
        assert!(!skip_response_header("x-request-id"));
    }

    #[test]
    fn test_wire_headers_lowercases_names() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));
        headers.insert("X-Custom", HeaderValue::from_static("v"));
        let wire = wire_headers(&headers);
        assert_eq!(wire.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(wire.get("x-custom").map(String::as_str), Some("v"));
        assert!(!wire.contains_key("Content-Type"));
    }

    #[tokio::test]
    async fn test_success_outcome_keeps_agent_headers_minus_skipped() {
        let outcome = Outcome::Success {
            status: 201,
            headers: HashMap::from([
                ("content-type".to_string(), "application/json".to_string()),
                ("x-handler".to_string(), "items".to_string()),
                ("date".to_string(), "yesterday".to_string()),
                ("content-length".to_string(), "9999".to_string()),
            ]),
            body: HttpBody::Text("{\"ok\":true}".to_string()),
        };
        let response = outcome_response("R0X1", outcome);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("x-handler").unwrap(), "items");
        assert!(response.headers().get("date").is_none());

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_binary_success_outcome_passes_bytes_through() {
        let payload = vec![0u8, 159, 146, 150];
        let outcome = Outcome::Success {
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/octet-stream".to_string(),
            )]),
            body: HttpBody::Bytes(payload.clone()),
        };
        let response = outcome_response("R0X1", outcome);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_timeout_outcome_maps_to_504_envelope() {
        let response = outcome_response("R0X1", Outcome::Timeout);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Gateway Timeout");
        assert!(body["timestamp"].is_u64());
    }

    #[tokio::test]
    async fn test_unavailable_outcome_maps_to_502_envelope() {
        let response = outcome_response(
            "R0X1",
            Outcome::Unavailable {
                message: "No client connected to receive the request".to_string(),
            },
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Bad Gateway");
        assert_eq!(body["message"], "No client connected to receive the request");
    }

    #[tokio::test]
    async fn test_failure_outcome_keeps_agent_status() {
        let response = outcome_response(
            "R0X1",
            Outcome::Failure {
                status: 503,
                message: "backend down".to_string(),
            },
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["message"], "backend down");
    }

    #[tokio::test]
    async fn test_invalid_agent_status_falls_back_to_502() {
        let response = outcome_response(
            "R0X1",
            Outcome::Failure {
                status: 42, // not a valid HTTP status
                message: "weird".to_string(),
            },
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
