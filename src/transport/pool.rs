//! Connection pool: the client-facing entry point.
//!
//! Subscriptions to the same address share connections up to the combine
//! target. A single semaphore serializes the reuse-or-create decision so
//! that concurrent subscribes never open more connections than needed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ConnectionPool                │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ SocketId=1 → Connection (3 subs)       │  │
//! │  │ SocketId=2 → Connection (2 subs)       │  │
//! │  │ SocketId=3 → Connection (1 sub, auth)  │  │
//! │  └────────────────────────────────────────┘  │
//! │   semaphore: one reuse-or-create at a time   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Selection
//!
//! | Condition | Result |
//! |-----------|--------|
//! | Least-loaded match below combine target | Reuse |
//! | At `max_connections`, every connection at/above target | Reuse least-loaded |
//! | Otherwise | New connection |
//!
//! A connection matches when it is open, idle or connected, opened for the
//! same address (trailing `/` ignored) and, for authenticated requests,
//! already authenticated.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{SocketId, SubscriptionId};
use crate::options::ClientOptions;
use crate::protocol::{ApiBinding, DataEvent, MessageEvent, MessageHandler, Subscription};
use crate::transport::connection::{Connection, ConnectionStatus};
use crate::transport::diagnostics::PoolSnapshot;
use crate::transport::handle::SubscriptionHandle;
use crate::transport::socket::SocketFactory;
use crate::transport::websocket::WebSocketFactory;

// ============================================================================
// Types
// ============================================================================

type ConnectionMap = Arc<RwLock<FxHashMap<SocketId, Arc<Connection>>>>;

/// Callback for messages matched by a generic handler.
type GenericCallback = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

#[derive(Clone)]
struct GenericHandler {
    identifier: String,
    callback: GenericCallback,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Multiplexes subscriptions and queries over a set of connections.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(Arc::new(MyBinding), ClientOptions::new())?;
///
/// let handle = pool
///     .subscribe::<Trade, _>(
///         "wss://stream.example.com/ws",
///         json!({ "op": "subscribe", "topic": "trades" }),
///         false,
///         |event| println!("{:?}", event.data),
///         None,
///     )
///     .await?;
///
/// handle.on_connection_restored(|down| println!("back after {down:?}"));
/// pool.unsubscribe(&handle).await;
/// ```
pub struct ConnectionPool {
    binding: Arc<dyn ApiBinding>,
    options: Arc<ClientOptions>,
    factory: Arc<dyn SocketFactory>,

    /// Live connections by socket ID.
    connections: ConnectionMap,

    /// Serializes the reuse-or-create decision.
    semaphore: Semaphore,

    next_subscription_id: AtomicU64,
    generic_handlers: RwLock<Vec<GenericHandler>>,

    /// Cancelled on shutdown; stops periodic senders.
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool connecting over WebSockets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn new(binding: Arc<dyn ApiBinding>, options: ClientOptions) -> Result<Arc<Self>> {
        Self::with_factory(binding, options, Arc::new(WebSocketFactory))
    }

    /// Creates a pool whose sockets come from `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `options` are invalid.
    pub fn with_factory(
        binding: Arc<dyn ApiBinding>,
        options: ClientOptions,
        factory: Arc<dyn SocketFactory>,
    ) -> Result<Arc<Self>> {
        options.validate()?;

        Ok(Arc::new(Self {
            binding,
            options: Arc::new(options),
            factory,
            connections: Arc::new(RwLock::new(FxHashMap::default())),
            semaphore: Semaphore::new(1),
            next_subscription_id: AtomicU64::new(1),
            generic_handlers: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// ConnectionPool - Subscribe / Query
// ============================================================================

impl ConnectionPool {
    /// Subscribes with `request` on a connection to `address`.
    ///
    /// Every matched message is deserialized into `T` and passed to
    /// `handler`. A deserialization failure is reported to the handle's
    /// exception listeners. Firing `cancel` closes the subscription.
    ///
    /// # Errors
    ///
    /// - [`Error::Disposed`] after [`shutdown`](Self::shutdown)
    /// - [`Error::Cancelled`] if `cancel` already fired
    /// - [`Error::Connection`] / [`Error::ConnectionTimeout`] if connecting fails
    /// - [`Error::Authentication`] if authentication fails
    /// - [`Error::Paused`] if the selected connection is paused
    /// - [`Error::SubscriptionRejected`] / [`Error::RequestTimeout`] if not confirmed
    pub async fn subscribe<T, F>(
        &self,
        address: &str,
        request: Value,
        authenticated: bool,
        handler: F,
        cancel: Option<CancellationToken>,
    ) -> Result<SubscriptionHandle>
    where
        T: DeserializeOwned + 'static,
        F: Fn(DataEvent<T>) + Send + Sync + 'static,
    {
        let subscription = Arc::new(Subscription::from_request(
            self.next_subscription_id(),
            request,
            true,
            authenticated,
            self.typed_handler(handler),
        ));
        self.subscribe_with(address, subscription, cancel).await
    }

    /// Subscribes to messages matching a static `identifier`.
    ///
    /// Nothing is sent; the subscription is confirmed as soon as the
    /// connection is ready.
    ///
    /// # Errors
    ///
    /// Same as [`subscribe`](Self::subscribe), minus the confirmation errors.
    pub async fn subscribe_identifier<T, F>(
        &self,
        address: &str,
        identifier: impl Into<String>,
        authenticated: bool,
        handler: F,
        cancel: Option<CancellationToken>,
    ) -> Result<SubscriptionHandle>
    where
        T: DeserializeOwned + 'static,
        F: Fn(DataEvent<T>) + Send + Sync + 'static,
    {
        let subscription = Arc::new(Subscription::from_identifier(
            self.next_subscription_id(),
            identifier,
            true,
            authenticated,
            self.typed_handler(handler),
        ));
        self.subscribe_with(address, subscription, cancel).await
    }

    /// Sends a one-shot request and deserializes the matching response.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] if no response matched in time
    /// - the binding's error if the server answered with one
    /// - [`Error::Json`] if the result does not deserialize into `T`
    /// - connection errors as for [`subscribe`](Self::subscribe)
    pub async fn query<T: DeserializeOwned>(
        &self,
        address: &str,
        request: Value,
        authenticated: bool,
    ) -> Result<T> {
        self.ensure_active()?;

        let connection = {
            let _permit = self.semaphore.acquire().await.map_err(|_| Error::Disposed)?;
            let connection = self.connection_for(address, authenticated).await?;
            self.connect_if_needed(&connection, authenticated).await?;
            connection
        };

        if connection.is_paused() {
            return Err(Error::Paused);
        }

        let binding = Arc::clone(&self.binding);
        let expected = request.clone();
        let result = connection
            .send_and_wait(&request, self.options.response_timeout, move |message| {
                binding.matches_query(message, &expected)
            })
            .await?;

        trace!(socket_id = %connection.id(), "Query answered");
        Ok(serde_json::from_value(result)?)
    }

    /// Closes the subscription behind `handle`.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.close().await;
    }

    /// Closes the subscription with `id`. Returns `false` if it is not found.
    pub async fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let found = self
            .connections()
            .into_iter()
            .find_map(|c| c.subscription(id).map(|s| (c, s)));

        let Some((connection, subscription)) = found else {
            debug!(subscription_id = %id, "Unsubscribe for unknown subscription");
            return false;
        };

        connection.close_subscription(&subscription, false).await;
        true
    }

    /// Closes every connection, and with them every subscription.
    pub async fn unsubscribe_all(&self) {
        let connections = self.connections();
        if connections.is_empty() {
            return;
        }

        info!(connections = connections.len(), "Closing all subscriptions");
        join_all(connections.iter().map(|c| c.close())).await;
    }

    /// Makes every connection reconnect and resubscribe.
    pub async fn reconnect_all(&self) {
        let connections = self.connections();
        info!(connections = connections.len(), "Reconnecting all connections");
        join_all(connections.iter().map(|c| c.trigger_reconnect())).await;
    }
}

// ============================================================================
// ConnectionPool - Generic Handlers
// ============================================================================

impl ConnectionPool {
    /// Attaches a handler for messages matching `identifier` to every
    /// current and future connection.
    ///
    /// Generic handlers do not count toward the combine target and do not
    /// keep a connection open.
    pub fn add_generic_handler(
        &self,
        identifier: impl Into<String>,
        callback: impl Fn(&MessageEvent) + Send + Sync + 'static,
    ) {
        let handler = GenericHandler {
            identifier: identifier.into(),
            callback: Arc::new(callback),
        };

        for connection in self.connections() {
            connection.add_subscription(self.generic_subscription(&handler));
        }
        self.generic_handlers.write().push(handler);
    }

    /// Sends the frame produced by `builder` on every open connection each
    /// `interval`, until shutdown.
    ///
    /// `builder` returning `None` skips that connection for the tick.
    /// Must be called inside a tokio runtime.
    pub fn send_periodic(
        &self,
        identifier: impl Into<String>,
        interval: Duration,
        builder: impl Fn(&Connection) -> Option<Value> + Send + Sync + 'static,
    ) {
        let identifier = identifier.into();
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.clone();

        debug!(%identifier, interval_ms = interval.as_millis() as u64, "Periodic sender started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let targets: Vec<Arc<Connection>> = connections.read().values().cloned().collect();
                for connection in targets {
                    if !connection.is_open() {
                        continue;
                    }
                    let Some(request) = builder(&connection) else {
                        continue;
                    };

                    trace!(%identifier, socket_id = %connection.id(), "Sending periodic frame");
                    if let Err(e) = connection.send(&request) {
                        warn!(%identifier, socket_id = %connection.id(), error = %e, "Periodic send failed");
                    }
                }
            }

            debug!(%identifier, "Periodic sender stopped");
        });
    }
}

// ============================================================================
// ConnectionPool - Diagnostics
// ============================================================================

impl ConnectionPool {
    /// Returns the connection with `id`.
    #[must_use]
    pub fn connection(&self, id: SocketId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Returns a snapshot of all connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns the number of open user subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.connections()
            .iter()
            .map(|c| c.user_subscription_count())
            .sum()
    }

    /// Inbound throughput of all connections in kilobytes per second.
    #[must_use]
    pub fn incoming_kbps(&self) -> f64 {
        self.connections().iter().map(|c| c.incoming_kbps()).sum()
    }

    /// Returns a diagnostics snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut connections: Vec<_> = self.connections().iter().map(|c| c.snapshot()).collect();
        connections.sort_by_key(|c| c.id);

        PoolSnapshot {
            subscriptions: connections.iter().map(|c| c.user_subscriptions).sum(),
            incoming_kbps: connections.iter().map(|c| c.incoming_kbps).sum(),
            connections,
        }
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[inline]
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stops periodic senders, disposes every connection and rejects
    /// further calls. Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        let connections: Vec<Arc<Connection>> = self
            .connections
            .write()
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        info!(connections = connections.len(), "Shutting down connection pool");
        join_all(connections.iter().map(|c| c.dispose())).await;
    }
}

// ============================================================================
// ConnectionPool - Internal
// ============================================================================

impl ConnectionPool {
    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId::new(self.next_subscription_id.fetch_add(1, Ordering::Relaxed))
    }

    fn typed_handler<T, F>(&self, handler: F) -> MessageHandler
    where
        T: DeserializeOwned + 'static,
        F: Fn(DataEvent<T>) + Send + Sync + 'static,
    {
        let binding = Arc::clone(&self.binding);
        Box::new(move |event: &MessageEvent| {
            let topic = binding.topic(&event.data);
            handler(event.to_data_event::<T>(topic)?);
            Ok(())
        })
    }

    fn generic_subscription(&self, handler: &GenericHandler) -> Arc<Subscription> {
        let callback = Arc::clone(&handler.callback);
        let subscription = Subscription::from_identifier(
            self.next_subscription_id(),
            handler.identifier.clone(),
            false,
            false,
            Box::new(move |event| {
                callback(event);
                Ok(())
            }),
        );
        subscription.set_confirmed(true);
        Arc::new(subscription)
    }

    async fn subscribe_with(
        &self,
        address: &str,
        subscription: Arc<Subscription>,
        cancel: Option<CancellationToken>,
    ) -> Result<SubscriptionHandle> {
        self.ensure_active()?;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let authenticated = subscription.is_authenticated();
        let connection = {
            let mut permit = Some(self.semaphore.acquire().await.map_err(|_| Error::Disposed)?);

            let connection = loop {
                let connection = self.connection_for(address, authenticated).await?;
                if connection.add_subscription(Arc::clone(&subscription)) {
                    break connection;
                }
                debug!(socket_id = %connection.id(), "Selected connection is closing, selecting again");
            };

            if self.options.subscriptions_combine_target == 1 {
                drop(permit.take());
            }

            if let Err(e) = self.connect_if_needed(&connection, authenticated).await {
                connection.remove_subscription(&subscription);
                return Err(e);
            }
            drop(permit);
            connection
        };

        if connection.is_paused() {
            warn!(socket_id = %connection.id(), "Connection paused, rejecting subscription");
            connection.remove_subscription(&subscription);
            return Err(Error::Paused);
        }

        match subscription.request() {
            Some(request) => {
                if let Err(e) = connection.subscribe_and_wait(&request, &subscription).await {
                    warn!(
                        socket_id = %connection.id(),
                        subscription_id = %subscription.id(),
                        error = %e,
                        "Subscription failed"
                    );
                    connection.close_subscription(&subscription, e.is_timeout()).await;
                    return Err(e);
                }
            }
            None => subscription.set_confirmed(true),
        }

        if let Some(token) = cancel {
            let watched = Arc::clone(&subscription);
            let owner = Arc::clone(&connection);
            subscription.set_cancel_watch(tokio::spawn(async move {
                token.cancelled().await;
                debug!(subscription_id = %watched.id(), "Subscription cancelled by caller");
                // closing aborts this watch, so close from a task of its own
                tokio::spawn(async move {
                    owner.close_subscription(&watched, false).await;
                });
            }));
        }

        info!(
            socket_id = %connection.id(),
            subscription_id = %subscription.id(),
            "Subscription completed"
        );
        Ok(SubscriptionHandle::new(connection, subscription))
    }

    /// Picks a reusable connection for `address` or creates a new one.
    ///
    /// Caller must hold the semaphore.
    async fn connection_for(&self, address: &str, authenticated: bool) -> Result<Arc<Connection>> {
        let target = self.options.subscriptions_combine_target;
        let tag = address.trim_end_matches('/');

        let reusable = {
            let connections = self.connections.read();
            let best = connections
                .values()
                .filter(|c| {
                    matches!(c.status(), ConnectionStatus::None | ConnectionStatus::Connected)
                        && c.is_open()
                        && c.tag().trim_end_matches('/') == tag
                        && (!authenticated || c.is_authenticated())
                })
                .min_by_key(|c| c.user_subscription_count())
                .cloned();

            best.filter(|best| {
                let at_cap = self
                    .options
                    .max_connections
                    .is_some_and(|max| connections.len() >= max);
                best.user_subscription_count() < target
                    || (at_cap
                        && connections
                            .values()
                            .all(|c| c.user_subscription_count() >= target))
            })
        };

        if let Some(connection) = reusable {
            trace!(socket_id = %connection.id(), "Reusing connection");
            return Ok(connection);
        }

        let url = self.binding.connection_url(address, authenticated).await?;
        let socket = self.factory.create(&url, &self.options.socket);
        let connection = Connection::new(
            socket,
            address,
            Arc::clone(&self.binding),
            Arc::clone(&self.options),
        );

        let connections = Arc::downgrade(&self.connections);
        connection.set_closing_hook(move |id| {
            if let Some(connections) = connections.upgrade() {
                connections.write().remove(&id);
            }
        });

        let handlers = self.generic_handlers.read().clone();
        for handler in &handlers {
            connection.add_subscription(self.generic_subscription(handler));
        }

        debug!(socket_id = %connection.id(), %url, "Created connection");
        Ok(connection)
    }

    /// Connects and authenticates `connection` as needed.
    async fn connect_if_needed(&self, connection: &Arc<Connection>, authenticated: bool) -> Result<()> {
        if !connection.is_open() {
            connection.connect().await?;
            self.connections
                .write()
                .insert(connection.id(), Arc::clone(connection));
            info!(socket_id = %connection.id(), url = %connection.url(), "Connection established");

            if !self.options.delay_after_connect.is_zero() {
                tokio::time::sleep(self.options.delay_after_connect).await;
            }
        }

        if !authenticated || connection.is_authenticated() {
            return Ok(());
        }

        debug!(socket_id = %connection.id(), "Authenticating connection");
        if let Err(e) = self.binding.authenticate(connection).await {
            warn!(socket_id = %connection.id(), error = %e, "Authentication failed, closing connection");
            connection.close().await;
            return Err(e.into_authentication());
        }

        connection.set_authenticated(true);
        info!(socket_id = %connection.id(), "Connection authenticated");
        Ok(())
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;

    use crate::testing::{
        TopicBinding, count_frames, eventually, init_tracing, query_request, respond,
        subscribe_request, update,
    };
    use crate::transport::memory::MemorySocketFactory;

    const ADDRESS: &str = "memory://stream";

    #[derive(Debug, Deserialize)]
    struct Update {
        topic: String,
        data: i64,
    }

    struct Fixture {
        pool: Arc<ConnectionPool>,
        factory: MemorySocketFactory,
        binding: Arc<TopicBinding>,
    }

    fn fixture_with(options: ClientOptions, binding: TopicBinding) -> Fixture {
        init_tracing();
        let factory = MemorySocketFactory::new().with_responder(respond);
        let binding = Arc::new(binding);
        let pool = ConnectionPool::with_factory(binding.clone(), options, Arc::new(factory.clone()))
            .expect("pool");
        Fixture {
            pool,
            factory,
            binding,
        }
    }

    fn fixture(options: ClientOptions) -> Fixture {
        fixture_with(options, TopicBinding::default())
    }

    async fn collect(
        pool: &ConnectionPool,
        topic: &str,
        authenticated: bool,
    ) -> Result<(SubscriptionHandle, Arc<Mutex<Vec<i64>>>)> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = pool
            .subscribe(
                ADDRESS,
                subscribe_request(topic),
                authenticated,
                move |event: DataEvent<Update>| sink.lock().push(event.data.data),
                None,
            )
            .await?;
        Ok((handle, seen))
    }

    fn user_counts(pool: &ConnectionPool) -> Vec<usize> {
        let mut counts: Vec<usize> = pool
            .connections()
            .iter()
            .map(|c| c.user_subscription_count())
            .collect();
        counts.sort_unstable();
        counts
    }

    #[tokio::test]
    async fn test_subscribe_receives_typed_updates() {
        let f = fixture(ClientOptions::new());
        let topics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&topics);

        let handle = f
            .pool
            .subscribe(
                ADDRESS,
                subscribe_request("trades"),
                false,
                move |event: DataEvent<Update>| {
                    sink.lock().push((event.topic.clone(), event.data.topic, event.data.data));
                },
                None,
            )
            .await
            .expect("subscribe");

        assert!(handle.is_confirmed());
        f.factory.sockets()[0].inject(update("trades", json!(5)));

        assert!(eventually(|| topics.lock().len() == 1).await);
        assert_eq!(
            topics.lock()[0],
            (Some("trades".to_string()), "trades".to_string(), 5)
        );
        assert_eq!(f.pool.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_subscription_closes_connection() {
        let f = fixture(ClientOptions::new());
        let (handle, _) = collect(&f.pool, "trades", false).await.expect("subscribe");
        handle.on_connection_closed(|| {});
        assert_eq!(handle.connection().events().len(), 1);

        f.pool.unsubscribe(&handle).await;

        let socket = f.factory.sockets()[0].clone();
        assert!(handle.is_closed());
        assert!(handle.connection().events().is_empty());
        assert_eq!(f.pool.connection_count(), 0);
        assert_eq!(socket.close_count(), 1);
        assert_eq!(count_frames(&socket.sent(), "unsubscribe", Some("trades")), 1);

        handle.close().await;
        assert_eq!(socket.close_count(), 1);
    }

    #[tokio::test]
    async fn test_combine_target_and_connection_cap() {
        let f = fixture(
            ClientOptions::new()
                .with_combine_target(2)
                .with_max_connections(2),
        );

        let mut handles = Vec::new();
        for i in 0..5 {
            let (handle, _) = collect(&f.pool, &format!("t{i}"), false).await.expect("subscribe");
            handles.push(handle);
        }

        assert_eq!(f.factory.sockets().len(), 2);
        assert_eq!(f.pool.connection_count(), 2);
        assert_eq!(user_counts(&f.pool), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_trailing_slash_shares_connection() {
        let f = fixture(ClientOptions::new());
        let _a = collect(&f.pool, "a", false).await.expect("subscribe");
        let _b = f
            .pool
            .subscribe_identifier(
                "memory://stream/",
                "heartbeat",
                false,
                |_: DataEvent<Value>| {},
                None,
            )
            .await
            .expect("subscribe");

        assert_eq!(f.pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_share_one_connection() {
        let f = fixture(ClientOptions::new());

        let results = join_all((0..5).map(|i| {
            f.pool.subscribe(
                ADDRESS,
                subscribe_request(&format!("c{i}")),
                false,
                |_: DataEvent<Update>| {},
                None,
            )
        }))
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(f.factory.sockets().len(), 1);
        assert_eq!(f.pool.subscription_count(), 5);
    }

    #[tokio::test]
    async fn test_combine_target_one_isolates_subscriptions() {
        let f = fixture(ClientOptions::new().with_combine_target(1));

        let results = join_all((0..3).map(|i| {
            f.pool.subscribe(
                ADDRESS,
                subscribe_request(&format!("solo{i}")),
                false,
                |_: DataEvent<Update>| {},
                None,
            )
        }))
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(f.pool.connection_count(), 3);
        assert_eq!(user_counts(&f.pool), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let f = fixture(ClientOptions::new());
        let (first, seen) = collect(&f.pool, "a", false).await.expect("subscribe");
        let _second = collect(&f.pool, "b", false).await.expect("subscribe");

        let lost = Arc::new(AtomicUsize::new(0));
        let restored = Arc::new(AtomicUsize::new(0));
        let (l, r) = (Arc::clone(&lost), Arc::clone(&restored));
        first.on_connection_lost(move || {
            l.fetch_add(1, Ordering::SeqCst);
        });
        first.on_connection_restored(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let socket = f.factory.sockets()[0].clone();
        socket.simulate_reconnect();

        assert!(eventually(|| restored.load(Ordering::SeqCst) == 1).await);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(first.is_confirmed());
        for topic in ["a", "b"] {
            assert_eq!(count_frames(&socket.sent(), "subscribe", Some(topic)), 2);
        }

        socket.inject(update("a", json!(9)));
        assert!(eventually(|| *seen.lock() == vec![9]).await);
    }

    #[tokio::test]
    async fn test_identifier_subscription_not_resent() {
        let f = fixture(ClientOptions::new());
        let _request = collect(&f.pool, "a", false).await.expect("subscribe");
        let beats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&beats);
        let heartbeat = f
            .pool
            .subscribe_identifier(
                ADDRESS,
                "heartbeat",
                false,
                move |_: DataEvent<Value>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .await
            .expect("subscribe");
        assert!(heartbeat.is_confirmed());

        let socket = f.factory.sockets()[0].clone();
        socket.simulate_reconnect();
        assert!(eventually(|| f.pool.connections()[0].status() == ConnectionStatus::Connected).await);

        assert_eq!(socket.sent().len(), 2);
        assert_eq!(count_frames(&socket.sent(), "subscribe", None), 2);

        socket.inject(json!({ "event": "heartbeat" }).to_string());
        assert!(eventually(|| beats.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_query() -> anyhow::Result<()> {
        let f = fixture(ClientOptions::new());

        let answer: i64 = f.pool.query(ADDRESS, query_request(json!(7)), false).await?;
        assert_eq!(answer, 7);

        let mismatch = tokio_test::assert_err!(
            f.pool
                .query::<String>(ADDRESS, query_request(json!(7)), false)
                .await
        );
        assert!(matches!(mismatch, Error::Json(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let f = fixture(ClientOptions::new().with_response_timeout(Duration::from_millis(50)));
        let mut request = query_request(json!(1));
        request["silent"] = json!(true);

        let err = f
            .pool
            .query::<Value>(ADDRESS, request, false)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(f.pool.connections()[0].pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_authenticated_connection_reused() {
        let f = fixture(ClientOptions::new());

        let _a = collect(&f.pool, "private-a", true).await.expect("subscribe");
        let _b = collect(&f.pool, "private-b", true).await.expect("subscribe");
        let _c = collect(&f.pool, "public", false).await.expect("subscribe");

        assert_eq!(f.pool.connection_count(), 1);
        assert_eq!(f.binding.auth_calls.load(Ordering::SeqCst), 1);
        assert!(f.pool.connections()[0].is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticated_request_skips_public_connection() {
        let f = fixture(ClientOptions::new());

        let _public = collect(&f.pool, "public", false).await.expect("subscribe");
        let _private = collect(&f.pool, "private", true).await.expect("subscribe");

        assert_eq!(f.pool.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let f = fixture_with(ClientOptions::new(), TopicBinding::with_key("bad"));

        let err = collect(&f.pool, "private", true).await.unwrap_err();

        assert!(matches!(err, Error::Authentication { .. }));
        assert_eq!(f.pool.connection_count(), 0);
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_subscription() {
        let f = fixture(ClientOptions::new());

        let err = collect(&f.pool, "reject-me", false).await.unwrap_err();

        assert!(matches!(err, Error::SubscriptionRejected { .. }));
        assert_eq!(f.pool.connection_count(), 0);
        assert_eq!(count_frames(&f.factory.sockets()[0].sent(), "unsubscribe", None), 0);
    }

    #[tokio::test]
    async fn test_subscribe_timeout_forces_unsubscribe() {
        let f = fixture(ClientOptions::new().with_response_timeout(Duration::from_millis(50)));

        let err = collect(&f.pool, "silent-topic", false).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(
            count_frames(&f.factory.sockets()[0].sent(), "unsubscribe", Some("silent-topic")),
            1
        );
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let f = fixture(ClientOptions::new());
        f.factory.set_fail_connect(true);

        let err = tokio_test::assert_err!(collect(&f.pool, "a", false).await);

        assert!(err.is_connection_error());
        assert_eq!(f.pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_token_closes_subscription() {
        let f = fixture(ClientOptions::new());
        let token = CancellationToken::new();

        let handle = f
            .pool
            .subscribe(
                ADDRESS,
                subscribe_request("a"),
                false,
                |_: DataEvent<Update>| {},
                Some(token.clone()),
            )
            .await
            .expect("subscribe");

        token.cancel();

        assert!(eventually(|| handle.is_closed() && f.pool.connection_count() == 0).await);
        assert_eq!(count_frames(&f.factory.sockets()[0].sent(), "unsubscribe", None), 1);

        let err = f
            .pool
            .subscribe(ADDRESS, subscribe_request("b"), false, |_: DataEvent<Update>| {}, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_closed_subscriptions_release_lifecycle_listeners() {
        let f = fixture(ClientOptions::new());
        let (kept, _) = collect(&f.pool, "kept", false).await.expect("subscribe");
        let token = CancellationToken::new();
        let cancelled = f
            .pool
            .subscribe(
                ADDRESS,
                subscribe_request("cancelled"),
                false,
                |_: DataEvent<Update>| {},
                Some(token.clone()),
            )
            .await
            .expect("subscribe");
        let (by_id, _) = collect(&f.pool, "by-id", false).await.expect("subscribe");

        let lost = Arc::new(AtomicUsize::new(0));
        for handle in [&cancelled, &by_id] {
            let counter = Arc::clone(&lost);
            handle.on_connection_lost(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let connection = Arc::clone(cancelled.connection());
        assert_eq!(connection.events().len(), 2);

        token.cancel();
        assert!(eventually(|| cancelled.is_closed() && connection.events().len() == 1).await);
        assert!(f.pool.unsubscribe_id(by_id.id()).await);
        assert!(connection.events().is_empty());

        // nothing sticks to a handle that is already closed
        cancelled.on_connection_restored(|_| {});
        assert!(connection.events().is_empty());

        let restored = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&restored);
        kept.on_connection_restored(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f.factory.sockets()[0].simulate_reconnect();

        assert!(eventually(|| restored.load(Ordering::SeqCst) == 1).await);
        assert_eq!(lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paused_connection_rejects_subscribe() {
        let f = fixture(ClientOptions::new());
        let (handle, _) = collect(&f.pool, "a", false).await.expect("subscribe");
        let paused = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&paused);
        handle.on_activity_paused(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        f.factory.sockets()[0].inject(json!({ "event": "pause" }).to_string());
        assert!(eventually(|| paused.load(Ordering::SeqCst) == 1).await);

        let err = collect(&f.pool, "b", false).await.unwrap_err();
        assert!(matches!(err, Error::Paused));
        assert_eq!(f.pool.connection_count(), 1);
        assert_eq!(f.pool.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let f = fixture(ClientOptions::new());
        let failing = f
            .pool
            .subscribe(
                ADDRESS,
                subscribe_request("a"),
                false,
                |_: DataEvent<Update>| panic!("handler bug"),
                None,
            )
            .await
            .expect("subscribe");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        failing.on_exception(move |e| sink.lock().push(e.to_string()));
        let (_healthy, seen) = collect(&f.pool, "a", false).await.expect("subscribe");

        let socket = f.factory.sockets()[0].clone();
        socket.inject(update("a", json!(1)));
        socket.inject(update("a", json!("not a number")));
        socket.inject(update("a", json!(2)));

        assert!(eventually(|| seen.lock().len() == 2).await);
        assert!(eventually(|| errors.lock().len() == 3).await);
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(errors.lock()[0], "Handler error: handler bug");
        assert!(errors.lock()[1].starts_with("JSON error"));
    }

    #[tokio::test]
    async fn test_updates_delivered_in_order() {
        let f = fixture(ClientOptions::new());
        let (_handle, seen) = collect(&f.pool, "seq", false).await.expect("subscribe");
        let socket = f.factory.sockets()[0].clone();

        for i in 0..100 {
            socket.inject(update("seq", json!(i)));
        }

        assert!(eventually(|| seen.lock().len() == 100).await);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_generic_handler_and_unhandled_messages() {
        let f = fixture(ClientOptions::new());
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        f.pool.add_generic_handler("ping", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _handle = collect(&f.pool, "a", false).await.expect("subscribe");

        let socket = f.factory.sockets()[0].clone();
        socket.inject(json!({ "event": "ping" }).to_string());
        socket.inject(json!({ "event": "mystery" }).to_string());

        assert!(eventually(|| f.binding.unhandled.load(Ordering::SeqCst) == 1).await);
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert_eq!(f.pool.subscription_count(), 1);
        assert_eq!(f.pool.connections()[0].subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_send_periodic_until_shutdown() {
        let f = fixture(ClientOptions::new());
        let _handle = collect(&f.pool, "a", false).await.expect("subscribe");
        f.pool.send_periodic("keepalive", Duration::from_millis(20), |_| {
            Some(json!({ "op": "ping" }))
        });

        let socket = f.factory.sockets()[0].clone();
        assert!(eventually(|| count_frames(&socket.sent(), "ping", None) >= 2).await);

        f.pool.shutdown().await;
        let sent = count_frames(&socket.sent(), "ping", None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count_frames(&socket.sent(), "ping", None), sent);
    }

    #[tokio::test]
    async fn test_reconnect_all_and_unsubscribe_all() {
        let f = fixture(ClientOptions::new().with_combine_target(1));
        for i in 0..3 {
            collect(&f.pool, &format!("s{i}"), false).await.expect("subscribe");
        }

        f.pool.reconnect_all().await;
        assert!(eventually(|| f
            .pool
            .connections()
            .iter()
            .all(|c| c.status() == ConnectionStatus::Connected))
        .await);
        assert!(f.factory.sockets().iter().all(|s| s.reconnect_count() == 1));

        f.pool.unsubscribe_all().await;
        assert_eq!(f.pool.connection_count(), 0);
        assert!(f.factory.sockets().iter().all(|s| s.close_count() == 1));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id() {
        let f = fixture(ClientOptions::new());
        let (first, _) = collect(&f.pool, "a", false).await.expect("subscribe");
        let (_second, _) = collect(&f.pool, "b", false).await.expect("subscribe");

        assert!(f.pool.unsubscribe_id(first.id()).await);
        assert!(!f.pool.unsubscribe_id(first.id()).await);
        assert!(first.is_closed());
        assert_eq!(f.pool.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_and_rejects() {
        let f = fixture(ClientOptions::new());
        let (handle, _) = collect(&f.pool, "a", false).await.expect("subscribe");
        let connection = Arc::clone(handle.connection());

        f.pool.shutdown().await;
        f.pool.shutdown().await;

        assert!(f.pool.is_disposed());
        assert_eq!(connection.status(), ConnectionStatus::Disposed);
        assert_eq!(f.pool.connection_count(), 0);
        assert!(matches!(
            collect(&f.pool, "b", false).await,
            Err(Error::Disposed)
        ));
        assert!(matches!(
            f.pool.query::<Value>(ADDRESS, query_request(json!(1)), false).await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_snapshot() -> anyhow::Result<()> {
        let f = fixture(ClientOptions::new());
        let _a = collect(&f.pool, "a", false).await?;
        let _b = collect(&f.pool, "b", false).await?;

        let snapshot = f.pool.snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.subscriptions, 2);
        assert_eq!(snapshot.connections[0].tag, ADDRESS);

        let json = serde_json::to_value(&snapshot)?;
        assert_eq!(json["connections"][0]["status"], "Connected");
        Ok(())
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = ConnectionPool::with_factory(
            Arc::new(TopicBinding::default()),
            ClientOptions::new().with_combine_target(0),
            Arc::new(MemorySocketFactory::new()),
        );
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
