//! Caller-side handle to a subscription.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::identifiers::{ListenerId, SocketId, SubscriptionId};
use crate::protocol::Subscription;
use crate::transport::connection::Connection;

// ============================================================================
// SubscriptionHandle
// ============================================================================

/// Returned by a successful subscribe.
///
/// Exposes the connection lifecycle events relevant to the subscription and
/// closes it. Lifecycle listeners registered through the handle are removed
/// once the subscription is unsubscribed, by the handle, the pool or its
/// cancellation token.
pub struct SubscriptionHandle {
    connection: Arc<Connection>,
    subscription: Arc<Subscription>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id())
            .field("connection_id", &self.connection_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SubscriptionHandle {
    pub(crate) fn new(connection: Arc<Connection>, subscription: Arc<Subscription>) -> Self {
        Self {
            connection,
            subscription,
        }
    }

    /// Returns the subscription ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Returns the ID of the connection carrying the subscription.
    #[inline]
    #[must_use]
    pub fn connection_id(&self) -> SocketId {
        self.connection.id()
    }

    /// Returns the connection carrying the subscription.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Returns `true` while the server has acknowledged the subscription.
    #[inline]
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.subscription.is_confirmed()
    }

    /// Returns `true` once the subscription has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    /// Called when the connection drops and starts reconnecting.
    pub fn on_connection_lost(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.on_event(move |event| {
            if matches!(event, ConnectionEvent::Lost) {
                f();
            }
        })
    }

    /// Called with the downtime once the connection is restored and resubscribed.
    pub fn on_connection_restored(&self, f: impl Fn(Duration) + Send + Sync + 'static) -> ListenerId {
        self.on_event(move |event| {
            if let ConnectionEvent::Restored(down) = event {
                f(*down);
            }
        })
    }

    /// Called when the connection closes for good.
    pub fn on_connection_closed(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.on_event(move |event| {
            if matches!(event, ConnectionEvent::Closed) {
                f();
            }
        })
    }

    /// Called when the server pauses activity on the connection.
    pub fn on_activity_paused(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.on_event(move |event| {
            if matches!(event, ConnectionEvent::Paused) {
                f();
            }
        })
    }

    /// Called when the server resumes activity on the connection.
    pub fn on_activity_unpaused(&self, f: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.on_event(move |event| {
            if matches!(event, ConnectionEvent::Unpaused) {
                f();
            }
        })
    }

    /// Called when the data handler of this subscription fails.
    pub fn on_exception(&self, f: impl Fn(&Error) + Send + Sync + 'static) -> ListenerId {
        self.subscription.exceptions().add(f)
    }

    /// Removes a listener registered through this handle.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.subscription.untrack_listener(id);
        self.connection.events().remove(id) || self.subscription.exceptions().remove(id)
    }

    /// Closes the subscription. Idempotent.
    pub async fn close(&self) {
        self.connection.close_subscription(&self.subscription, false).await;
    }

    /// Forces the carrying connection to reconnect and resubscribe.
    pub async fn reconnect(&self) {
        self.connection.trigger_reconnect().await;
    }

    fn on_event(&self, f: impl Fn(&ConnectionEvent) + Send + Sync + 'static) -> ListenerId {
        let id = self.connection.events().add(f);
        if !self.subscription.track_listener(id) {
            // already closed
            self.connection.events().remove(id);
        }
        id
    }
}
