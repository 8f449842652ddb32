//! Connection lifecycle events and listener registries.
//!
//! Events are raised from transport callbacks but delivered on a dedicated
//! task per connection, so a slow listener never stalls the receive loop and
//! listeners observe events in the order they were raised.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::ListenerId;

// ============================================================================
// ConnectionEvent
// ============================================================================

/// Lifecycle notification observed by subscription holders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The socket dropped; a reconnect is in progress.
    Lost,
    /// Reconnected and resubscribed after being down for the given duration.
    Restored(Duration),
    /// The connection is closed for good.
    Closed,
    /// The server asked the client to pause activity.
    Paused,
    /// The server lifted a previous pause.
    Unpaused,
}

// ============================================================================
// EventListeners
// ============================================================================

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of callbacks keyed by [`ListenerId`].
pub struct EventListeners<E> {
    entries: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E> fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.len())
            .finish()
    }
}

impl<E> EventListeners<E> {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener and returns its id.
    pub fn add(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId::next();
        self.entries.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns `true` if it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Invokes every listener with `event`.
    ///
    /// Listeners run against a snapshot, so they may add or remove listeners.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no listener is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// EventQueue
// ============================================================================

/// Ordered, off-loop delivery of [`ConnectionEvent`]s.
///
/// Must be created inside a tokio runtime. The delivery task ends when the
/// queue is dropped.
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    listeners: Arc<EventListeners<ConnectionEvent>>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let listeners = Arc::new(EventListeners::new());

        let delivery = Arc::clone(&listeners);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                trace!(?event, "Delivering connection event");
                delivery.emit(&event);
            }
        });

        Self { tx, listeners }
    }

    /// Queues an event for delivery.
    pub(crate) fn push(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }

    #[inline]
    pub(crate) fn listeners(&self) -> &EventListeners<ConnectionEvent> {
        &self.listeners
    }
}

// ============================================================================
// Tests
// ============================================================================
