//! Request correlation table.
//!
//! Maps in-flight request ids to the oneshot that answers the original HTTP
//! call. `resolve` is an atomic take: the entry is removed, its timer
//! cancelled, and the outcome delivered in one pass, so whichever terminal
//! path wins the race (response, timeout, abort, unavailable) is structurally
//! the only one that can write — the losers observe `NotFound`.
//!
//! The table is deliberately NOT swept when the agent disconnects: in-flight
//! requests keep pending and terminate through their own timeouts, which
//! tolerates a brief agent reconnect window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::body::HttpBody;

/// The one authoritative request-lifecycle vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Created,
    Forwarded,
    Responded,
    TimedOut,
    Aborted,
    Unavailable,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Created => "created",
            RequestStatus::Forwarded => "forwarded",
            RequestStatus::Responded => "responded",
            RequestStatus::TimedOut => "timed_out",
            RequestStatus::Aborted => "aborted",
            RequestStatus::Unavailable => "unavailable",
        }
    }
}

/// Terminal outcome delivered to the HTTP intake. Exactly one per request id.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The agent answered; body already transcoded for the HTTP layer.
    Success {
        status: u16,
        headers: HashMap<String, String>,
        body: HttpBody,
    },
    /// The agent reported a failure (status >= 400 or an explicit error frame).
    Failure { status: u16, message: String },
    /// No response within the configured deadline.
    Timeout,
    /// The request was never sent (no usable agent connection).
    Unavailable { message: String },
    /// The HTTP client went away first; nothing will be written.
    Aborted,
}

impl Outcome {
    fn terminal_status(&self) -> RequestStatus {
        match self {
            Outcome::Success { .. } | Outcome::Failure { .. } => RequestStatus::Responded,
            Outcome::Timeout => RequestStatus::TimedOut,
            Outcome::Unavailable { .. } => RequestStatus::Unavailable,
            Outcome::Aborted => RequestStatus::Aborted,
        }
    }
}

/// Result of a `resolve` call. Only the caller that observes `Delivered` won
/// the race for this request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    NotFound,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddError {
    #[error("request id `{0}` is already pending")]
    DuplicateRequestId(String),
}

struct PendingRequest {
    reply: oneshot::Sender<Outcome>,
    created_at: Instant,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    responded: AtomicU64,
    timed_out: AtomicU64,
    aborted: AtomicU64,
    unavailable: AtomicU64,
}

struct Inner {
    map: Mutex<HashMap<String, PendingRequest>>,
    counters: Counters,
}

/// Cheap-to-clone handle to the shared table.
#[derive(Clone)]
pub struct PendingTable {
    inner: Arc<Inner>,
}

/// Point-in-time counters for `/status` and the `status_query` control reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub pending: usize,
    pub created: u64,
    pub responded: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub unavailable: u64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                map: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Insert a fresh entry. Ids are generated with a hashed nonce so a
    /// duplicate should not happen, but it is checked regardless.
    pub fn add(&self, request_id: &str, reply: oneshot::Sender<Outcome>) -> Result<(), AddError> {
        let mut map = self.inner.map.lock().expect("pending lock poisoned");
        if map.contains_key(request_id) {
            return Err(AddError::DuplicateRequestId(request_id.to_string()));
        }
        map.insert(
            request_id.to_string(),
            PendingRequest {
                reply,
                created_at: Instant::now(),
                timer: None,
            },
        );
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Atomic take: remove the entry, cancel its timer, deliver the outcome.
    ///
    /// Returns `NotFound` when another terminal path already won. Delivery to
    /// a receiver that has gone away (client abort) is not an error — the
    /// entry is still destroyed and no response is written anywhere.
    pub fn resolve(&self, request_id: &str, outcome: Outcome) -> Resolution {
        let entry = {
            let mut map = self.inner.map.lock().expect("pending lock poisoned");
            map.remove(request_id)
        };
        let Some(entry) = entry else {
            return Resolution::NotFound;
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }

        let status = outcome.terminal_status();
        let counter = match status {
            RequestStatus::Responded => &self.inner.counters.responded,
            RequestStatus::TimedOut => &self.inner.counters.timed_out,
            RequestStatus::Aborted => &self.inner.counters.aborted,
            RequestStatus::Unavailable => &self.inner.counters.unavailable,
            RequestStatus::Created | RequestStatus::Forwarded => {
                unreachable!("non-terminal outcome")
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            request_id,
            status = status.as_str(),
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "pending request resolved"
        );
        if entry.reply.send(outcome).is_err() {
            debug!(request_id, "outcome receiver already gone, nothing written");
        }
        Resolution::Delivered
    }

    /// Arm the full-request deadline. The timer body calls `resolve` and only
    /// proceeds if it won the race; resolving through any other path cancels
    /// the timer. A no-op when the entry is already gone, so a request whose
    /// forward failed can never leave an orphaned timer behind.
    pub fn schedule_timeout(&self, request_id: &str, after: Duration) {
        let mut map = self.inner.map.lock().expect("pending lock poisoned");
        let Some(entry) = map.get_mut(request_id) else {
            return;
        };
        let table = self.clone();
        let id = request_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if table.resolve(&id, Outcome::Timeout) == Resolution::Delivered {
                warn!(request_id = %id, "request timed out waiting for agent response");
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.inner.map.lock().expect("pending lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TableStats {
        let c = &self.inner.counters;
        TableStats {
            pending: self.len(),
            created: c.created.load(Ordering::Relaxed),
            responded: c.responded.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            aborted: c.aborted.load(Ordering::Relaxed),
            unavailable: c.unavailable.load(Ordering::Relaxed),
        }
    }
}

/// Resolves an entry with `Aborted` when dropped before `disarm`.
///
/// The intake handler holds one of these across its await on the outcome; if
/// the HTTP client disconnects, axum drops the handler future and the guard
/// cancels the timer and frees the entry without writing a response.
pub struct AbortGuard {
    table: PendingTable,
    request_id: String,
    armed: bool,
}

impl AbortGuard {
    pub fn new(table: PendingTable, request_id: String) -> Self {
        Self {
            table,
            request_id,
            armed: true,
        }
    }

    /// Call once a terminal outcome has been received.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed
            && self.table.resolve(&self.request_id, Outcome::Aborted) == Resolution::Delivered
        {
            debug!(request_id = %self.request_id, "http client aborted, entry cleaned up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &PendingTable, id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        table.add(id, tx).unwrap();
        rx
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let table = PendingTable::new();
        let _rx = entry(&table, "R0X1");
        let (tx, _rx2) = oneshot::channel();
        assert_eq!(
            table.add("R0X1", tx),
            Err(AddError::DuplicateRequestId("R0X1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_resolve_is_effective_at_most_once() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");

        assert_eq!(
            table.resolve("R0X1", Outcome::Timeout),
            Resolution::Delivered
        );
        assert_eq!(
            table.resolve("R0X1", Outcome::Aborted),
            Resolution::NotFound
        );
        assert_eq!(rx.await.unwrap(), Outcome::Timeout);
    }

    #[tokio::test]
    async fn test_timeout_fires_and_late_response_is_ignored() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");
        table.schedule_timeout("R0X1", Duration::from_millis(20));

        assert_eq!(rx.await.unwrap(), Outcome::Timeout);
        // Late agent response for the same id is a dropped no-op.
        assert_eq!(
            table.resolve(
                "R0X1",
                Outcome::Failure {
                    status: 500,
                    message: "late".to_string()
                }
            ),
            Resolution::NotFound
        );
        assert_eq!(table.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_resolve_cancels_timer() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");
        table.schedule_timeout("R0X1", Duration::from_millis(30));

        table.resolve(
            "R0X1",
            Outcome::Failure {
                status: 502,
                message: "gone".to_string(),
            },
        );
        assert!(matches!(rx.await.unwrap(), Outcome::Failure { status: 502, .. }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let stats = table.stats();
        assert_eq!(stats.timed_out, 0);
        assert_eq!(stats.responded, 1);
    }

    #[tokio::test]
    async fn test_schedule_timeout_for_missing_entry_is_noop() {
        let table = PendingTable::new();
        table.schedule_timeout("R0Xmissing", Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.stats().timed_out, 0);
    }

    #[tokio::test]
    async fn test_abort_guard_resolves_on_drop() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");
        table.schedule_timeout("R0X1", Duration::from_millis(200));

        {
            let _guard = AbortGuard::new(table.clone(), "R0X1".to_string());
            // guard dropped without disarm, as when the client disconnects
        }
        assert!(table.is_empty());
        assert_eq!(table.stats().aborted, 1);
        // Receiver observes the abort outcome (or closure); no response write.
        assert!(matches!(rx.await, Ok(Outcome::Aborted) | Err(_)));
    }

    #[tokio::test]
    async fn test_abort_guard_disarmed_is_inert() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");

        let mut guard = AbortGuard::new(table.clone(), "R0X1".to_string());
        table.resolve(
            "R0X1",
            Outcome::Success {
                status: 200,
                headers: HashMap::new(),
                body: HttpBody::Empty,
            },
        );
        guard.disarm();
        drop(guard);

        assert!(matches!(rx.await.unwrap(), Outcome::Success { status: 200, .. }));
        let stats = table.stats();
        assert_eq!(stats.aborted, 0);
        assert_eq!(stats.responded, 1);
    }

    #[tokio::test]
    async fn test_delivery_to_dropped_receiver_still_destroys_entry() {
        let table = PendingTable::new();
        let rx = entry(&table, "R0X1");
        drop(rx);
        assert_eq!(
            table.resolve("R0X1", Outcome::Timeout),
            Resolution::Delivered
        );
        assert!(table.is_empty());
    }
}
