//! Outstanding requests awaiting a matching response.
//!
//! Responses on subscription APIs rarely carry a correlation id the client
//! controls, so a [`PendingRequest`] owns a matcher predicate instead. Every
//! inbound message is offered to the outstanding requests of its connection
//! in registration order; the first matcher that claims it completes that
//! request.
//!
//! # Completion
//!
//! A request completes exactly once, by whichever comes first:
//!
//! | Source | Result |
//! |--------|--------|
//! | Matcher claims a message | matcher's `Ok` / `Err` |
//! | Deadline passes | [`Error::RequestTimeout`] |
//! | Connection drops | [`Error::ConnectionClosed`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Types
// ============================================================================

/// Decides whether an inbound message answers a request.
///
/// `None` means "not mine"; `Some` completes the request with that result.
pub type ResponseMatcher = Box<dyn Fn(&Value) -> Option<Result<Value>> + Send + Sync>;

// ============================================================================
// PendingRequest
// ============================================================================

/// A request waiting for its response.
pub struct PendingRequest {
    id: RequestId,
    matcher: ResponseMatcher,
    timeout: Duration,
    deadline: Instant,
    completion: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl PendingRequest {
    /// Creates a pending request and the receiver its result is delivered to.
    #[must_use]
    pub fn new(
        matcher: impl Fn(&Value) -> Option<Result<Value>> + Send + Sync + 'static,
        timeout: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            id: RequestId::next(),
            matcher: Box::new(matcher),
            timeout,
            deadline: Instant::now() + timeout,
            completion: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    /// Returns the request ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Returns the configured timeout.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `true` once a result has been delivered.
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Returns `true` if the deadline has passed.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Offers an inbound message to the matcher.
    ///
    /// Returns `true` if the message completed this request.
    pub fn check(&self, message: &Value) -> bool {
        if self.is_completed() {
            return false;
        }

        match (self.matcher)(message) {
            Some(result) => self.complete(result),
            None => false,
        }
    }

    /// Completes the request with a timeout error.
    pub fn time_out(&self) -> bool {
        self.complete(Err(Error::request_timeout(
            self.id,
            self.timeout.as_millis() as u64,
        )))
    }

    /// Completes the request with `error`.
    pub fn fail(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Delivers `result` if nothing was delivered yet.
    fn complete(&self, result: Result<Value>) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            return false;
        };

        trace!(request_id = %self.id, ok = result.is_ok(), "Pending request completed");
        let _ = tx.send(result);
        true
    }
}

// ============================================================================
// PendingRequests
// ============================================================================

/// Ordered list of a connection's outstanding requests.
#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Mutex<Vec<Arc<PendingRequest>>>,
}

impl PendingRequests {
    /// Creates an empty list.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request.
    pub fn add(&self, request: Arc<PendingRequest>) {
        self.requests.lock().push(request);
    }

    /// Removes a request by id.
    pub fn remove(&self, id: RequestId) {
        self.requests.lock().retain(|r| r.id() != id);
    }

    /// Returns the number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Times out and drops every request whose deadline has passed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut requests = self.requests.lock();
            let (expired, live): (Vec<_>, Vec<_>) =
                requests.drain(..).partition(|r| r.is_expired(now));
            *requests = live;
            expired
        };

        for request in &expired {
            request.time_out();
        }
        expired.len()
    }

    /// Offers `message` to each request in order.
    ///
    /// The first request that claims it is completed and removed. Returns
    /// `true` if one did.
    pub fn resolve(&self, message: &Value) -> bool {
        let snapshot: Vec<_> = self.requests.lock().clone();

        for request in snapshot {
            if request.check(message) {
                self.remove(request.id());
                return true;
            }
        }
        false
    }

    /// Fails and drops every outstanding request.
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let drained: Vec<_> = self.requests.lock().drain(..).collect();
        let count = drained.len();

        for request in drained {
            request.fail(error());
        }
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
