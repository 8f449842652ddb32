//! Subscription state owned by a connection.
//!
//! A subscription is keyed either by the request that created it (resent on
//! every reconnect) or by a static identifier (matched without any traffic).
//! Identifier subscriptions are also how generic, non-user handlers are
//! attached to a connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::events::EventListeners;
use crate::identifiers::{ListenerId, SubscriptionId};
use crate::protocol::MessageEvent;

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for every message routed to a subscription.
pub type MessageHandler = Box<dyn Fn(&MessageEvent) -> Result<()> + Send + Sync>;

/// How a subscription is matched and restored.
pub enum SubscriptionKind {
    /// Created by a request; resent after every reconnect.
    Request(Mutex<Value>),
    /// Matched by a static key; never resent.
    Identifier(String),
}

impl fmt::Debug for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(request) => f.debug_tuple("Request").field(&*request.lock()).finish(),
            Self::Identifier(identifier) => f.debug_tuple("Identifier").field(identifier).finish(),
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A live subscription on one connection.
pub struct Subscription {
    id: SubscriptionId,
    kind: SubscriptionKind,
    user_subscription: bool,
    authenticated: bool,
    confirmed: AtomicBool,
    closed: AtomicBool,
    handler: MessageHandler,
    exceptions: EventListeners<Error>,
    /// Connection listeners registered for this subscription; `None` once released.
    connection_listeners: Mutex<Option<Vec<ListenerId>>>,
    cancel_watch: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("user_subscription", &self.user_subscription)
            .field("authenticated", &self.authenticated)
            .field("confirmed", &self.is_confirmed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Subscription - Constructor
// ============================================================================

impl Subscription {
    /// Creates a subscription established by `request`.
    #[must_use]
    pub fn from_request(
        id: SubscriptionId,
        request: Value,
        user_subscription: bool,
        authenticated: bool,
        handler: MessageHandler,
    ) -> Self {
        Self::with_kind(
            id,
            SubscriptionKind::Request(Mutex::new(request)),
            user_subscription,
            authenticated,
            handler,
        )
    }

    /// Creates a subscription matched by a static `identifier`.
    #[must_use]
    pub fn from_identifier(
        id: SubscriptionId,
        identifier: impl Into<String>,
        user_subscription: bool,
        authenticated: bool,
        handler: MessageHandler,
    ) -> Self {
        Self::with_kind(
            id,
            SubscriptionKind::Identifier(identifier.into()),
            user_subscription,
            authenticated,
            handler,
        )
    }

    fn with_kind(
        id: SubscriptionId,
        kind: SubscriptionKind,
        user_subscription: bool,
        authenticated: bool,
        handler: MessageHandler,
    ) -> Self {
        Self {
            id,
            kind,
            user_subscription,
            authenticated,
            confirmed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handler,
            exceptions: EventListeners::new(),
            connection_listeners: Mutex::new(Some(Vec::new())),
            cancel_watch: Mutex::new(None),
        }
    }
}

// ============================================================================
// Subscription - Public API
// ============================================================================

impl Subscription {
    /// Returns the subscription ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the subscription kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    /// Returns a copy of the subscribe request, if request-based.
    #[must_use]
    pub fn request(&self) -> Option<Value> {
        match &self.kind {
            SubscriptionKind::Request(request) => Some(request.lock().clone()),
            SubscriptionKind::Identifier(_) => None,
        }
    }

    /// Replaces the stored subscribe request. No-op for identifier subscriptions.
    pub fn set_request(&self, value: Value) {
        if let SubscriptionKind::Request(request) = &self.kind {
            *request.lock() = value;
        }
    }

    /// Returns the identifier, if identifier-based.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        match &self.kind {
            SubscriptionKind::Identifier(identifier) => Some(identifier),
            SubscriptionKind::Request(_) => None,
        }
    }

    /// Returns `true` if the caller created this subscription.
    #[inline]
    #[must_use]
    pub fn is_user_subscription(&self) -> bool {
        self.user_subscription
    }

    /// Returns `true` if this subscription needs an authenticated connection.
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns `true` once the server acknowledged the subscription.
    #[inline]
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Sets the confirmed flag.
    #[inline]
    pub fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::Release);
    }

    /// Returns `true` once the subscription has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the subscription closed. Returns `false` if it already was.
    pub fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first && let Some(watch) = self.cancel_watch.lock().take() {
            watch.abort();
        }
        first
    }

    /// Attaches the task that closes this subscription on caller cancellation.
    pub fn set_cancel_watch(&self, watch: JoinHandle<()>) {
        if self.is_closed() {
            watch.abort();
            return;
        }
        if let Some(previous) = self.cancel_watch.lock().replace(watch) {
            previous.abort();
        }
    }

    /// Registry of listeners notified when the handler fails.
    #[inline]
    #[must_use]
    pub fn exceptions(&self) -> &EventListeners<Error> {
        &self.exceptions
    }

    /// Ties a connection listener to this subscription so it is removed
    /// when the subscription closes.
    ///
    /// Returns `false` if the listeners were already released; the caller
    /// must remove the listener itself.
    pub fn track_listener(&self, id: ListenerId) -> bool {
        match self.connection_listeners.lock().as_mut() {
            Some(ids) => {
                ids.push(id);
                true
            }
            None => false,
        }
    }

    /// Stops tracking a listener removed by its owner.
    pub fn untrack_listener(&self, id: ListenerId) {
        if let Some(ids) = self.connection_listeners.lock().as_mut() {
            ids.retain(|tracked| *tracked != id);
        }
    }

    /// Takes every tracked listener id. Later calls to
    /// [`track_listener`](Self::track_listener) are refused.
    pub(crate) fn release_listeners(&self) -> Vec<ListenerId> {
        self.connection_listeners.lock().take().unwrap_or_default()
    }

    /// Runs the handler for `event`.
    ///
    /// A handler error or panic is reported to this subscription's exception
    /// listeners only. Returns `false` if the handler did not succeed.
    pub fn handle(&self, event: &MessageEvent) -> bool {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.handler)(event)));

        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e,
            Err(panic) => Error::handler(panic_message(panic.as_ref())),
        };

        tracing::warn!(subscription_id = %self.id, error = %error, "Subscription handler failed");
        self.exceptions.emit(&error);
        false
    }
}

/// Extracts the message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
