//! Correlation of outbound commands with their asynchronous replies.
//!
//! Each pending request is keyed by a caller-chosen correlation key (an
//! order number for `print_qr`). At most one request per key may be in
//! flight. A request ends exactly once: resolved by a success reply,
//! rejected by an error reply, timed out, or cancelled on teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use sorthub_protocol::constants::{EventName, ORDER_NUMBER_FIELD};
use sorthub_protocol::envelope::Frame;

use crate::error::RequestError;

type Reply = Result<serde_json::Value, RequestError>;

/// Inbound event pair that settles pending requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    pub success_event: String,
    pub error_event: String,
    /// Payload field holding the correlation key.
    pub key_field: String,
}

impl ReplyRoute {
    pub fn new(
        success_event: impl Into<String>,
        error_event: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            success_event: success_event.into(),
            error_event: error_event.into(),
            key_field: key_field.into(),
        }
    }

    /// `print_success` / `print_error`, keyed by `order_number`.
    pub fn print() -> Self {
        Self::new(
            EventName::PrintSuccess,
            EventName::PrintError,
            ORDER_NUMBER_FIELD,
        )
    }
}

struct Pending {
    ticket: u64,
    tx: oneshot::Sender<Reply>,
    deadline: Instant,
}

/// Map of pending requests plus the routes that settle them.
pub struct RequestTracker {
    routes: Vec<ReplyRoute>,
    next_ticket: AtomicU64,
    pending: Mutex<HashMap<String, Pending>>,
}

impl RequestTracker {
    pub fn new(routes: Vec<ReplyRoute>) -> Self {
        Self {
            routes,
            next_ticket: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a pending request under `key`.
    ///
    /// Fails with [`RequestError::EmptyKey`] for an empty key, which no
    /// reply can carry, and with [`RequestError::DuplicateRequest`] if `key`
    /// is already in flight. Dropping the returned handle before it settles
    /// frees the key.
    pub fn register(
        self: &Arc<Self>,
        key: &str,
        timeout: Duration,
    ) -> Result<PendingRequest, RequestError> {
        if key.is_empty() {
            return Err(RequestError::EmptyKey);
        }
        let mut pending = self.lock();
        if pending.contains_key(key) {
            return Err(RequestError::DuplicateRequest(key.to_string()));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(
            key.to_string(),
            Pending {
                ticket,
                tx,
                deadline: Instant::now() + timeout,
            },
        );
        debug!(key = %key, ?timeout, "request registered");

        Ok(PendingRequest {
            key: key.to_string(),
            ticket,
            timeout,
            rx,
            tracker: Arc::clone(self),
        })
    }

    /// Settles a pending request if `frame` is a reply on one of the
    /// configured routes. Returns `true` if a pending request was settled.
    ///
    /// Replies for keys with no pending entry (late or duplicate replies)
    /// are logged and dropped.
    pub fn handle_reply(&self, frame: &Frame) -> bool {
        for route in &self.routes {
            let outcome = if frame.event == route.success_event {
                Ok(frame.data_or_null())
            } else if frame.event == route.error_event {
                Err(error_message(frame))
            } else {
                continue;
            };

            let Some(key) = frame.correlation_key(&route.key_field) else {
                warn!(
                    event = %frame.event,
                    field = %route.key_field,
                    "reply without correlation key"
                );
                return false;
            };

            let reply = outcome.map_err(|message| RequestError::Remote {
                key: key.clone(),
                message,
            });
            return self.settle(&key, reply);
        }
        false
    }

    /// Resolves the request under `key` with `payload`.
    pub fn resolve(&self, key: &str, payload: serde_json::Value) -> bool {
        self.settle(key, Ok(payload))
    }

    /// Rejects every pending request with [`RequestError::ConnectionClosed`].
    /// Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, Pending)> = self.lock().drain().collect();
        let count = drained.len();
        for (key, p) in drained {
            debug!(key = %key, "request cancelled");
            let _ = p.tx.send(Err(RequestError::ConnectionClosed));
        }
        count
    }

    /// Removes entries whose deadline has passed, rejecting them with
    /// [`RequestError::Timeout`]. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut pending = self.lock();
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(p) = pending.remove(key) {
                let _ = p.tx.send(Err(RequestError::Timeout(key.clone())));
            }
        }
        expired.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn settle(&self, key: &str, reply: Reply) -> bool {
        let Some(p) = self.lock().remove(key) else {
            warn!(key = %key, "reply for unknown request, dropping");
            return false;
        };
        debug!(key = %key, ok = reply.is_ok(), "request settled");
        // The waiter may have been dropped already; nothing to deliver then.
        let _ = p.tx.send(reply);
        true
    }

    /// Removes `key` only if it still belongs to `ticket`.
    fn forget(&self, key: &str, ticket: u64) -> bool {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|p| p.ticket == ticket) {
            pending.remove(key);
            return true;
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .data
        .as_ref()
        .and_then(|d| d.get("error").or_else(|| d.get("message")))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "unknown error".into())
}

/// Handle for one in-flight request.
pub struct PendingRequest {
    key: String,
    ticket: u64,
    timeout: Duration,
    rx: oneshot::Receiver<Reply>,
    tracker: Arc<RequestTracker>,
}

impl PendingRequest {
    /// Waits for the reply, the deadline, or cancellation.
    pub async fn wait(mut self) -> Result<serde_json::Value, RequestError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => {
                if self.tracker.forget(&self.key, self.ticket) {
                    warn!(key = %self.key, "request timed out");
                    return Err(RequestError::Timeout(self.key.clone()));
                }
                // Settled between the deadline firing and the removal.
                match self.rx.try_recv() {
                    Ok(reply) => reply,
                    Err(_) => Err(RequestError::Timeout(self.key.clone())),
                }
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.tracker.forget(&self.key, self.ticket);
    }
}
