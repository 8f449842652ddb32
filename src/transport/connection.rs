//! Connection: one socket plus the subscriptions multiplexed over it.
//!
//! A connection routes every inbound message of its socket, either to the
//! outstanding request it answers or to the subscriptions it belongs to, and
//! restores its subscriptions whenever the socket reconnects.
//!
//! # Status
//!
//! | Status | Entered when | Exits to |
//! |--------|--------------|----------|
//! | `None` | Constructed | `Connected` |
//! | `Connected` | Socket opened, or resubscription succeeded | `Reconnecting`, `Closing` |
//! | `Reconnecting` | Socket lost its connection | `Resubscribing` |
//! | `Resubscribing` | Socket reconnected | `Connected`, or another reconnect |
//! | `Closing` | Last user subscription closed, or explicit close | `Closed` |
//! | `Closed` | Socket closed without reconnecting | terminal |
//! | `Disposed` | Explicit dispose | terminal |
//!
//! # Dispatch
//!
//! Messages of one connection are handled sequentially, in arrival order, on
//! the socket's receive path. Subscription handlers run inline; a failing
//! handler only affects its own subscription.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::events::{ConnectionEvent, EventListeners, EventQueue};
use crate::identifiers::{SocketId, SubscriptionId};
use crate::options::ClientOptions;
use crate::protocol::{
    ApiBinding, MessageEvent, PendingRequest, PendingRequests, Subscription, SubscriptionKind,
};
use crate::transport::diagnostics::{ConnectionSnapshot, SubscriptionSnapshot};
use crate::transport::socket::{Socket, SocketListener};

// ============================================================================
// Types
// ============================================================================

/// Called once when the connection starts closing, with its ID.
type ClosingHook = Box<dyn Fn(SocketId) + Send + Sync>;

// ============================================================================
// ConnectionStatus
// ============================================================================

/// Lifecycle status of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    /// Not connected yet.
    None,
    /// Connected and serving subscriptions.
    Connected,
    /// Socket lost, reconnecting.
    Reconnecting,
    /// Socket back, restoring subscriptions.
    Resubscribing,
    /// Shutting down.
    Closing,
    /// Closed for good.
    Closed,
    /// Disposed.
    Disposed,
}

impl ConnectionStatus {
    /// Returns `true` for `Closing`, `Closed` and `Disposed`.
    #[inline]
    #[must_use]
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Disposed)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A socket and the subscriptions multiplexed over it.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and always handled through an `Arc`.
pub struct Connection {
    socket: Arc<dyn Socket>,
    tag: String,
    binding: Arc<dyn ApiBinding>,
    options: Arc<ClientOptions>,
    status: Mutex<ConnectionStatus>,
    authenticated: AtomicBool,
    paused: AtomicBool,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    pending: PendingRequests,
    events: EventQueue,
    closing_hook: Mutex<Option<ClosingHook>>,
    disconnected_at: Mutex<Option<Instant>>,
    this: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("tag", &self.tag)
            .field("status", &self.status())
            .field("authenticated", &self.is_authenticated())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    /// Wraps `socket` and registers the connection as its listener.
    ///
    /// `tag` is the logical address the connection was opened for. Must be
    /// called inside a tokio runtime.
    #[must_use]
    pub fn new(
        socket: Arc<dyn Socket>,
        tag: impl Into<String>,
        binding: Arc<dyn ApiBinding>,
        options: Arc<ClientOptions>,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|this| Self {
            socket,
            tag: tag.into(),
            binding,
            options,
            status: Mutex::new(ConnectionStatus::None),
            authenticated: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            pending: PendingRequests::new(),
            events: EventQueue::new(),
            closing_hook: Mutex::new(None),
            disconnected_at: Mutex::new(None),
            this: this.clone(),
        });

        let listener: Weak<dyn SocketListener> = connection.this.clone();
        connection.socket.set_listener(listener);
        connection
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Returns the connection ID (the socket's ID).
    #[inline]
    #[must_use]
    pub fn id(&self) -> SocketId {
        self.socket.id()
    }

    /// Returns the address the connection was opened for.
    #[inline]
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the URL the socket is connected to.
    #[inline]
    #[must_use]
    pub fn url(&self) -> String {
        self.socket.url()
    }

    /// Returns the current status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Returns `true` while the socket is connected.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    /// Returns `true` once authenticated on the current socket connection.
    #[inline]
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// Returns `true` while the server has asked to pause activity.
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Sets the paused flag, notifying listeners on change.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) == paused {
            return;
        }

        info!(socket_id = %self.id(), paused, "Connection activity pause changed");
        self.events.push(if paused {
            ConnectionEvent::Paused
        } else {
            ConnectionEvent::Unpaused
        });
    }

    /// Inbound throughput in kilobytes per second.
    #[inline]
    #[must_use]
    pub fn incoming_kbps(&self) -> f64 {
        self.socket.incoming_kbps()
    }

    /// Registry of lifecycle listeners.
    #[inline]
    #[must_use]
    pub fn events(&self) -> &EventListeners<ConnectionEvent> {
        self.events.listeners()
    }

    /// Number of registered subscriptions, including generic handlers.
    #[inline]
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Number of open subscriptions created by callers.
    #[must_use]
    pub fn user_subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.is_user_subscription() && !s.is_closed())
            .count()
    }

    /// Number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns the subscription with `id`.
    #[must_use]
    pub fn subscription(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Returns a snapshot of all subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().clone()
    }

    /// Connects the socket.
    ///
    /// # Errors
    ///
    /// Returns the socket's connect error.
    pub async fn connect(&self) -> Result<()> {
        self.socket.connect().await
    }

    /// Serializes and sends `request` without waiting for a response.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if `request` cannot be serialized
    /// - [`Error::Connection`] if the socket no longer accepts frames
    pub fn send(&self, request: &Value) -> Result<()> {
        let text = serde_json::to_string(request)?;
        if !self.socket.send(text) {
            return Err(Error::connection("Socket no longer accepts frames"));
        }

        trace!(socket_id = %self.id(), "Request sent");
        Ok(())
    }

    /// Sends `request` and waits until `matcher` claims a response.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the socket is not open, or closes while waiting
    /// - [`Error::RequestTimeout`] if nothing matched within `timeout`
    /// - the matcher's error if the response reports one
    pub async fn send_and_wait<F>(&self, request: &Value, timeout: Duration, matcher: F) -> Result<Value>
    where
        F: Fn(&Value) -> Option<Result<Value>> + Send + Sync + 'static,
    {
        if !self.socket.is_open() {
            return Err(Error::ConnectionClosed);
        }

        let (pending, mut rx) = PendingRequest::new(matcher, timeout);
        let request_id = pending.id();
        self.pending.add(Arc::clone(&pending));

        if let Err(e) = self.send(request) {
            self.pending.remove(request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                pending.time_out();
                self.pending.remove(request_id);
                debug!(socket_id = %self.id(), %request_id, "Request timed out");
                // a match may have won the race against the timeout
                rx.try_recv().unwrap_or(Err(Error::ConnectionClosed))
            }
        }
    }

    /// Registers a subscription. Returns `false` if the connection is closing.
    pub fn add_subscription(&self, subscription: Arc<Subscription>) -> bool {
        let subscription_id = subscription.id();
        {
            // same lock order as close_subscription
            let mut subscriptions = self.subscriptions.lock();
            if self.status.lock().is_terminating() {
                return false;
            }
            subscriptions.push(subscription);
        }

        debug!(socket_id = %self.id(), %subscription_id, "Subscription added");
        true
    }

    /// Closes one subscription.
    ///
    /// Sends the binding's unsubscribe request when the subscription was
    /// confirmed (or `unsubscribe_unconfirmed` is set) and the socket is open.
    /// Closing the last user subscription closes the whole connection.
    /// Connection listeners tracked by the subscription are removed.
    pub async fn close_subscription(&self, subscription: &Subscription, unsubscribe_unconfirmed: bool) {
        if !subscription.mark_closed() {
            return;
        }
        for id in subscription.release_listeners() {
            self.events.listeners().remove(id);
        }
        if self.status().is_terminating() {
            return;
        }

        debug!(socket_id = %self.id(), subscription_id = %subscription.id(), "Closing subscription");

        if (unsubscribe_unconfirmed || subscription.is_confirmed())
            && self.socket.is_open()
            && let Some(request) = subscription.request()
            && let Some(unsubscribe) = self.binding.unsubscribe_request(&request)
            && let Err(e) = self.send(&unsubscribe)
        {
            warn!(socket_id = %self.id(), error = %e, "Failed to send unsubscribe request");
        }

        let should_close = {
            let subscriptions = self.subscriptions.lock();
            let mut status = self.status.lock();
            if status.is_terminating() {
                return;
            }
            let last = subscriptions
                .iter()
                .all(|s| !s.is_user_subscription() || s.is_closed());
            if last {
                *status = ConnectionStatus::Closing;
            }
            last
        };

        if should_close {
            info!(socket_id = %self.id(), "No subscriptions left, closing connection");
            self.close().await;
        }

        self.subscriptions
            .lock()
            .retain(|s| s.id() != subscription.id());
    }

    /// Drops the socket's current connection so it reconnects and resubscribes.
    pub async fn trigger_reconnect(&self) {
        self.socket.reconnect().await;
    }

    /// Closes the connection and its socket.
    pub async fn close(&self) {
        {
            let mut status = self.status.lock();
            if matches!(*status, ConnectionStatus::Closed | ConnectionStatus::Disposed) {
                return;
            }
            *status = ConnectionStatus::Closing;
        }

        info!(socket_id = %self.id(), "Closing connection");
        self.run_closing_hook();
        for subscription in self.subscriptions() {
            subscription.mark_closed();
        }

        self.socket.close().await;

        let mut status = self.status.lock();
        if *status == ConnectionStatus::Closing {
            *status = ConnectionStatus::Closed;
        }
    }

    /// Disposes the connection: fails outstanding requests and closes the socket.
    pub async fn dispose(&self) {
        {
            let mut status = self.status.lock();
            if *status == ConnectionStatus::Disposed {
                return;
            }
            *status = ConnectionStatus::Disposed;
        }

        debug!(socket_id = %self.id(), "Disposing connection");
        self.run_closing_hook();
        for subscription in self.subscriptions() {
            subscription.mark_closed();
        }
        self.pending.fail_all(|| Error::Disposed);
        self.socket.close().await;
    }

    /// Returns a diagnostics snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let subscriptions: Vec<SubscriptionSnapshot> = self
            .subscriptions()
            .iter()
            .map(|s| SubscriptionSnapshot::of(s))
            .collect();

        ConnectionSnapshot {
            id: self.id(),
            tag: self.tag.clone(),
            url: self.url(),
            status: self.status(),
            authenticated: self.is_authenticated(),
            paused: self.is_paused(),
            user_subscriptions: self.user_subscription_count(),
            pending_requests: self.pending_request_count(),
            incoming_kbps: self.incoming_kbps(),
            subscriptions,
        }
    }

    pub(crate) fn set_closing_hook(&self, hook: impl Fn(SocketId) + Send + Sync + 'static) {
        *self.closing_hook.lock() = Some(Box::new(hook));
    }

    /// Drops a subscription that never went live, without unsubscribing
    /// or closing the connection.
    pub(crate) fn remove_subscription(&self, subscription: &Subscription) {
        subscription.mark_closed();
        for id in subscription.release_listeners() {
            self.events.listeners().remove(id);
        }
        self.subscriptions
            .lock()
            .retain(|s| s.id() != subscription.id());
    }

    /// Sends a subscribe request and marks `subscription` confirmed on success.
    pub(crate) async fn subscribe_and_wait(&self, request: &Value, subscription: &Subscription) -> Result<()> {
        let binding = Arc::clone(&self.binding);
        let expected = request.clone();

        self.send_and_wait(request, self.options.response_timeout, move |message| {
            binding
                .matches_subscribe_response(message, &expected)
                .map(|answer| answer.map(|()| Value::Null))
        })
        .await?;

        subscription.set_confirmed(true);
        debug!(socket_id = %self.id(), subscription_id = %subscription.id(), "Subscription confirmed");
        Ok(())
    }
}

// ============================================================================
// Connection - Internal
// ============================================================================

impl Connection {
    fn run_closing_hook(&self) {
        let hook = self.closing_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.id());
        }
    }

    fn live_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    /// Routes one inbound message.
    fn handle_message(&self, text: String) {
        let started = Instant::now();

        let data: Value = match serde_json::from_str(&text) {
            Ok(data) => data,
            Err(e) => {
                warn!(socket_id = %self.id(), error = %e, "Failed to parse message");
                return;
            }
        };

        if let Some(paused) = self.binding.pause_signal(&data) {
            self.set_paused(paused);
        }

        self.pending.purge_expired(started);
        let mut handled = false;
        if self.pending.resolve(&data) {
            if !self.binding.continue_on_query_response() {
                return;
            }
            handled = true;
        }

        let original = self.options.output_original_data.then_some(text);
        let event = MessageEvent::new(self.id(), data, original);

        for subscription in self.live_subscriptions() {
            let matched = match subscription.kind() {
                SubscriptionKind::Identifier(identifier) => {
                    self.binding.matches_identifier(&event.data, identifier)
                }
                SubscriptionKind::Request(request) => {
                    let request = request.lock();
                    self.binding.matches_subscription(&event.data, &request)
                }
            };

            if matched {
                handled = true;
                subscription.handle(&event);
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.options.slow_handler_threshold {
            warn!(
                socket_id = %self.id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Message handling was slow, move heavy work out of data handlers"
            );
        }

        if !handled {
            self.binding.unhandled_message(&event.data);
            if !self.binding.unhandled_message_expected() {
                warn!(socket_id = %self.id(), message = %event.data, "Message not matched by any request or subscription");
            }
        }
    }

    async fn handle_reconnected(self: Arc<Self>) {
        match self.resubscribe().await {
            Ok(true) => {
                {
                    let mut status = self.status.lock();
                    if *status != ConnectionStatus::Resubscribing {
                        return;
                    }
                    *status = ConnectionStatus::Connected;
                }
                let down = self
                    .disconnected_at
                    .lock()
                    .take()
                    .map(|at| at.elapsed())
                    .unwrap_or_default();

                info!(socket_id = %self.id(), down_ms = down.as_millis() as u64, "Connection restored");
                self.events.push(ConnectionEvent::Restored(down));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(socket_id = %self.id(), error = %e, "Resubscription failed, reconnecting");
                self.socket.reconnect().await;
            }
        }
    }

    /// Re-authenticates and resends every live request subscription.
    ///
    /// Returns `Ok(false)` when there was nothing to restore and the
    /// connection was closed instead.
    async fn resubscribe(&self) -> Result<bool> {
        if !self.socket.is_open() {
            return Err(Error::connection("Socket not connected"));
        }

        let subscriptions = self.live_subscriptions();
        if !subscriptions.iter().any(|s| s.is_user_subscription()) {
            debug!(socket_id = %self.id(), "Nothing to resubscribe, closing connection");
            self.close().await;
            return Ok(false);
        }

        if subscriptions.iter().any(|s| s.is_authenticated()) {
            debug!(socket_id = %self.id(), "Re-authenticating before resubscribing");
            self.binding
                .authenticate(self)
                .await
                .map_err(Error::into_authentication)?;
            self.set_authenticated(true);
        }

        let (requests, identifiers): (Vec<_>, Vec<_>) = subscriptions
            .into_iter()
            .partition(|s| s.request().is_some());

        for subscription in identifiers {
            subscription.set_confirmed(true);
        }

        let batch_size = self.options.max_concurrent_resubscriptions.max(1);
        for batch in requests.chunks(batch_size) {
            if !self.socket.is_open() {
                return Err(Error::connection("Socket not connected"));
            }

            let results = join_all(batch.iter().map(|s| self.resend(s))).await;
            if let Some(error) = results.into_iter().find_map(Result::err) {
                return Err(error);
            }
        }

        if !self.socket.is_open() {
            return Err(Error::connection("Socket not connected"));
        }

        debug!(socket_id = %self.id(), restored = requests.len(), "All subscriptions restored");
        Ok(true)
    }

    async fn resend(&self, subscription: &Subscription) -> Result<()> {
        let Some(request) = subscription.request() else {
            return Ok(());
        };

        let request = self.binding.revitalize_request(request).await?;
        subscription.set_request(request.clone());
        self.subscribe_and_wait(&request, subscription).await
    }
}

// ============================================================================
// Connection - SocketListener
// ============================================================================

#[async_trait]
impl SocketListener for Connection {
    fn on_open(&self) {
        let mut status = self.status.lock();
        if *status == ConnectionStatus::None {
            *status = ConnectionStatus::Connected;
        }
        debug!(socket_id = %self.id(), url = %self.socket.url(), "Connection opened");
    }

    fn on_message(&self, message: String) {
        self.handle_message(message);
    }

    fn on_error(&self, error: &Error) {
        debug!(socket_id = %self.id(), error = %error, "Socket reported an error");
    }

    fn on_close(&self) {
        {
            let mut status = self.status.lock();
            if *status != ConnectionStatus::Disposed {
                *status = ConnectionStatus::Closed;
            }
        }

        self.run_closing_hook();
        self.set_authenticated(false);
        for subscription in self.subscriptions() {
            subscription.set_confirmed(false);
        }

        let failed = self.pending.fail_all(|| Error::ConnectionClosed);
        info!(socket_id = %self.id(), failed_requests = failed, "Connection closed");
        self.events.push(ConnectionEvent::Closed);
    }

    fn on_reconnecting(&self) {
        {
            let mut status = self.status.lock();
            if status.is_terminating() {
                return;
            }
            *status = ConnectionStatus::Reconnecting;
        }

        *self.disconnected_at.lock() = Some(Instant::now());
        self.set_authenticated(false);
        for subscription in self.subscriptions() {
            subscription.set_confirmed(false);
        }

        warn!(socket_id = %self.id(), "Connection lost, reconnecting");
        self.events.push(ConnectionEvent::Lost);
    }

    fn on_reconnected(&self) {
        {
            let mut status = self.status.lock();
            if status.is_terminating() {
                return;
            }
            *status = ConnectionStatus::Resubscribing;
        }

        let failed = self.pending.fail_all(|| Error::ConnectionClosed);
        info!(socket_id = %self.id(), failed_requests = failed, "Reconnected, resubscribing");

        if let Some(this) = self.this.upgrade() {
            tokio::spawn(this.handle_reconnected());
        }
    }

    async fn reconnection_url(&self) -> Option<String> {
        self.binding.reconnection_url(self).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use crate::identifiers::SubscriptionId;
    use crate::testing::{TopicBinding, count_frames, eventually, query_request, respond, subscribe_request, update};
    use crate::transport::memory::MemorySocket;

    struct Fixture {
        connection: Arc<Connection>,
        socket: MemorySocket,
        binding: Arc<TopicBinding>,
    }

    async fn connected(options: ClientOptions) -> Fixture {
        crate::testing::init_tracing();
        let socket = MemorySocket::new("memory://conn");
        socket.set_responder(Some(Arc::new(respond)));
        let binding = Arc::new(TopicBinding::default());
        let connection = Connection::new(
            Arc::new(socket.clone()),
            "memory://conn",
            binding.clone(),
            Arc::new(options),
        );
        connection.connect().await.expect("connect");
        Fixture {
            connection,
            socket,
            binding,
        }
    }

    fn collecting_subscription(
        id: u64,
        request: Value,
        authenticated: bool,
    ) -> (Arc<Subscription>, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = Arc::new(Subscription::from_request(
            SubscriptionId::new(id),
            request,
            true,
            authenticated,
            Box::new(move |event| {
                sink.lock().push(event.data["data"].clone());
                Ok(())
            }),
        ));
        (subscription, seen)
    }

    async fn subscribed(fixture: &Fixture, id: u64, topic: &str) -> (Arc<Subscription>, Arc<Mutex<Vec<Value>>>) {
        let request = subscribe_request(topic);
        let (subscription, seen) = collecting_subscription(id, request.clone(), false);
        assert!(fixture.connection.add_subscription(Arc::clone(&subscription)));
        fixture
            .connection
            .subscribe_and_wait(&request, &subscription)
            .await
            .expect("subscribe");
        (subscription, seen)
    }

    fn record_events(connection: &Connection) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        connection.events().add(move |event| sink.lock().push(*event));
        events
    }

    #[tokio::test]
    async fn test_open_sets_connected() {
        let fixture = connected(ClientOptions::new()).await;
        assert_eq!(fixture.connection.status(), ConnectionStatus::Connected);
        assert!(fixture.connection.is_open());
        assert_eq!(fixture.connection.id(), fixture.socket.id());
    }

    #[tokio::test]
    async fn test_messages_dispatched_in_order() {
        let fixture = connected(ClientOptions::new()).await;
        let (subscription, seen) = subscribed(&fixture, 1, "trades").await;
        assert!(subscription.is_confirmed());

        for seq in 0..200 {
            fixture.socket.inject(update("trades", json!(seq)));
        }

        assert!(eventually(|| seen.lock().len() == 200).await);
        let expected: Vec<Value> = (0..200).map(|seq| json!(seq)).collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_send_and_wait_resolves() {
        let fixture = connected(ClientOptions::new()).await;
        let request = query_request(json!({ "answer": 42 }));
        let expected = request.clone();
        let binding = Arc::clone(&fixture.binding);

        let result = tokio_test::assert_ok!(
            fixture
                .connection
                .send_and_wait(&request, Duration::from_secs(1), move |message| {
                    binding.matches_query(message, &expected)
                })
                .await
        );

        assert_eq!(result, json!({ "answer": 42 }));
        assert_eq!(fixture.connection.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let fixture = connected(ClientOptions::new()).await;
        let mut request = query_request(json!(1));
        request["silent"] = json!(true);

        let err = fixture
            .connection
            .send_and_wait(&request, Duration::from_millis(50), |_| None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(fixture.connection.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_send_and_wait_requires_open_socket() {
        let socket = MemorySocket::new("memory://idle");
        let connection = Connection::new(
            Arc::new(socket),
            "memory://idle",
            Arc::new(TopicBinding::default()),
            Arc::new(ClientOptions::new()),
        );

        let result = connection
            .send_and_wait(&json!({}), Duration::from_secs(1), |_| None)
            .await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(connection.status(), ConnectionStatus::None);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_others() {
        let fixture = connected(ClientOptions::new()).await;
        let failing = Arc::new(Subscription::from_request(
            SubscriptionId::new(10),
            subscribe_request("book"),
            true,
            false,
            Box::new(|_| Err(Error::handler("cannot decode"))),
        ));
        let exceptions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&exceptions);
        failing.exceptions().add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        fixture.connection.add_subscription(failing);
        let (_healthy, seen) = subscribed(&fixture, 11, "book").await;

        fixture.socket.inject(update("book", json!("level")));

        assert!(eventually(|| seen.lock().len() == 1).await);
        assert_eq!(exceptions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_every_request() {
        let fixture = connected(ClientOptions::new().with_max_concurrent_resubscriptions(2)).await;
        let events = record_events(&fixture.connection);
        for (id, topic) in ["a", "b", "c"].into_iter().enumerate() {
            subscribed(&fixture, id as u64 + 1, topic).await;
        }
        let heartbeat = Arc::new(Subscription::from_identifier(
            SubscriptionId::new(99),
            "heartbeat",
            false,
            false,
            Box::new(|_| Ok(())),
        ));
        fixture.connection.add_subscription(Arc::clone(&heartbeat));

        fixture.socket.simulate_reconnect();

        assert!(eventually(|| fixture.connection.status() == ConnectionStatus::Connected
            && events.lock().len() == 2)
        .await);
        assert_eq!(events.lock()[0], ConnectionEvent::Lost);
        assert!(matches!(events.lock()[1], ConnectionEvent::Restored(_)));

        let sent = fixture.socket.sent();
        for topic in ["a", "b", "c"] {
            assert_eq!(count_frames(&sent, "subscribe", Some(topic)), 2, "topic {topic}");
        }
        assert_eq!(fixture.binding.revitalized.load(Ordering::SeqCst), 3);
        assert!(heartbeat.is_confirmed());
        assert!(fixture.connection.subscriptions().iter().all(|s| s.is_confirmed()));
    }

    #[tokio::test]
    async fn test_reconnect_authenticates_before_resubscribing() {
        let fixture = connected(ClientOptions::new()).await;
        let request = subscribe_request("orders");
        let (subscription, _) = collecting_subscription(1, request.clone(), true);
        fixture.connection.add_subscription(Arc::clone(&subscription));
        fixture
            .connection
            .subscribe_and_wait(&request, &subscription)
            .await
            .expect("subscribe");

        fixture.socket.simulate_reconnect();
        assert!(eventually(|| fixture.connection.status() == ConnectionStatus::Connected).await);

        assert_eq!(fixture.binding.auth_calls.load(Ordering::SeqCst), 1);
        assert!(fixture.connection.is_authenticated());

        let ops: Vec<String> = fixture
            .socket
            .sent()
            .iter()
            .map(|frame| serde_json::from_str::<Value>(frame).expect("json")["op"].to_string())
            .collect();
        assert_eq!(ops, vec!["\"subscribe\"", "\"auth\"", "\"subscribe\""]);
    }

    #[tokio::test]
    async fn test_reconnect_without_user_subscriptions_closes() {
        let fixture = connected(ClientOptions::new()).await;
        fixture.connection.add_subscription(Arc::new(Subscription::from_identifier(
            SubscriptionId::new(1),
            "heartbeat",
            false,
            false,
            Box::new(|_| Ok(())),
        )));

        fixture.socket.simulate_reconnect();

        assert!(eventually(|| fixture.connection.status() == ConnectionStatus::Closed).await);
        assert_eq!(fixture.socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_resubscription_reconnects_again() {
        let fixture = connected(ClientOptions::new()).await;
        let (subscription, _) = collecting_subscription(1, subscribe_request("reject-me"), false);
        subscription.set_confirmed(true);
        fixture.connection.add_subscription(subscription);

        fixture.socket.simulate_reconnect();

        assert!(eventually(|| fixture.socket.reconnect_count() >= 3).await);
        fixture.connection.close().await;
        assert_eq!(fixture.connection.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_pending_requests_fail_on_reconnect() {
        let fixture = connected(ClientOptions::new()).await;
        let mut request = query_request(json!(1));
        request["silent"] = json!(true);

        let connection = Arc::clone(&fixture.connection);
        let waiter = tokio::spawn(async move {
            connection
                .send_and_wait(&request, Duration::from_secs(5), |_| None)
                .await
        });
        assert!(eventually(|| fixture.connection.pending_request_count() == 1).await);

        fixture.socket.drop_connection();
        fixture.socket.restore_connection();

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_closing_last_subscription_closes_connection() {
        let fixture = connected(ClientOptions::new()).await;
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hook_calls);
        fixture.connection.set_closing_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (first, _) = subscribed(&fixture, 1, "a").await;
        let (second, _) = subscribed(&fixture, 2, "b").await;

        fixture.connection.close_subscription(&first, false).await;
        assert_eq!(fixture.connection.status(), ConnectionStatus::Connected);
        assert_eq!(fixture.connection.subscription_count(), 1);

        fixture.connection.close_subscription(&second, false).await;
        assert_eq!(fixture.connection.status(), ConnectionStatus::Closed);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.socket.close_count(), 1);
        assert_eq!(count_frames(&fixture.socket.sent(), "unsubscribe", None), 2);

        // closing again is a no-op
        fixture.connection.close_subscription(&second, false).await;
        fixture.connection.close().await;
        assert_eq!(fixture.socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_subscription_skips_unsubscribe() {
        let fixture = connected(ClientOptions::new()).await;
        let (subscription, _) = collecting_subscription(1, subscribe_request("x"), false);
        fixture.connection.add_subscription(Arc::clone(&subscription));

        fixture.connection.close_subscription(&subscription, false).await;
        assert_eq!(count_frames(&fixture.socket.sent(), "unsubscribe", None), 0);
        assert!(!fixture.connection.add_subscription(subscription));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_racing_last_close_never_lands_on_closing_connection() {
        for round in 0..50 {
            let fixture = connected(ClientOptions::new()).await;
            let (last, _) = subscribed(&fixture, 1, "last").await;
            let (newcomer, _) = collecting_subscription(2, subscribe_request("new"), false);

            let closer = Arc::clone(&fixture.connection);
            let close = tokio::spawn(async move { closer.close_subscription(&last, false).await });
            let adder = Arc::clone(&fixture.connection);
            let add = tokio::spawn(async move { adder.add_subscription(newcomer) });

            close.await.expect("join");
            let added = add.await.expect("join");
            assert_eq!(
                added,
                !fixture.connection.status().is_terminating(),
                "round {round}"
            );
        }
    }

    #[tokio::test]
    async fn test_close_subscription_releases_tracked_listeners() {
        let fixture = connected(ClientOptions::new()).await;
        let (first, _) = subscribed(&fixture, 1, "a").await;
        let (_second, _) = subscribed(&fixture, 2, "b").await;

        let id = fixture.connection.events().add(|_| {});
        assert!(first.track_listener(id));
        let untracked = fixture.connection.events().add(|_| {});

        fixture.connection.close_subscription(&first, false).await;

        assert_eq!(fixture.connection.status(), ConnectionStatus::Connected);
        assert!(!fixture.connection.events().remove(id));
        assert!(fixture.connection.events().remove(untracked));
    }

    #[tokio::test]
    async fn test_pause_signal_toggles_and_notifies() {
        let fixture = connected(ClientOptions::new()).await;
        let events = record_events(&fixture.connection);

        fixture.socket.inject(json!({ "event": "pause" }).to_string());
        assert!(eventually(|| fixture.connection.is_paused()).await);
        fixture.socket.inject(json!({ "event": "resume" }).to_string());
        assert!(eventually(|| events.lock().len() == 2).await);

        assert!(!fixture.connection.is_paused());
        assert_eq!(*events.lock(), vec![ConnectionEvent::Paused, ConnectionEvent::Unpaused]);
    }

    #[tokio::test]
    async fn test_unhandled_and_original_data() {
        let fixture = connected(ClientOptions::new().with_original_data()).await;
        let raw = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&raw);
        fixture.connection.add_subscription(Arc::new(Subscription::from_identifier(
            SubscriptionId::new(1),
            "trade",
            true,
            false,
            Box::new(move |event| {
                *sink.lock() = event.original_data.clone();
                Ok(())
            }),
        )));

        fixture.socket.inject(r#"{"event":"trade"}"#);
        fixture.socket.inject(r#"{"other":1}"#);
        fixture.socket.inject("not json");

        assert!(eventually(|| fixture.binding.unhandled.load(Ordering::SeqCst) == 1).await);
        assert_eq!(raw.lock().as_deref(), Some(r#"{"event":"trade"}"#));
    }

    #[tokio::test]
    async fn test_remote_close_emits_closed() {
        let fixture = connected(ClientOptions::new()).await;
        let events = record_events(&fixture.connection);

        fixture.socket.simulate_remote_close();

        assert_eq!(fixture.connection.status(), ConnectionStatus::Closed);
        assert!(eventually(|| events.lock().as_slice() == [ConnectionEvent::Closed]).await);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let fixture = connected(ClientOptions::new()).await;
        subscribed(&fixture, 7, "ticker").await;

        let snapshot = fixture.connection.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.user_subscriptions, 1);
        assert_eq!(snapshot.subscriptions[0].id, SubscriptionId::new(7));
        assert!(snapshot.subscriptions[0].confirmed);
        assert!(serde_json::to_value(&snapshot).is_ok());
    }
}
