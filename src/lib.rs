//! ws-multiplex - Subscription-oriented WebSocket client engine.
//!
//! This library provides the connection machinery for clients of
//! subscription-style socket APIs: connect, authenticate, subscribe to
//! topics, receive a continuous stream of typed events and survive
//! disconnects by reconnecting and resubscribing transparently.
//!
//! # Architecture
//!
//! The engine is layered:
//!
//! - **Socket**: one physical connection with send, receive and idle loops
//!   and an automatic reconnect loop
//! - **Connection**: one socket plus the subscriptions and outstanding
//!   requests multiplexed over it; routes every inbound message
//! - **ConnectionPool**: picks or opens connections subject to the combine
//!   target and connection cap; the client-facing API
//!
//! Key design principles:
//!
//! - Everything schema-specific lives behind [`ApiBinding`]
//! - Messages of one connection are dispatched in arrival order
//! - A failing handler only affects its own subscription
//! - Callers only observe `Lost`/`Restored` notifications across reconnects
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use ws_multiplex::{ApiBinding, ClientOptions, ConnectionPool, DataEvent, Result};
//!
//! struct Stream;
//!
//! #[async_trait]
//! impl ApiBinding for Stream {
//!     fn matches_query(&self, message: &Value, request: &Value) -> Option<Result<Value>> {
//!         (message["id"] == request["id"]).then(|| Ok(message["result"].clone()))
//!     }
//!
//!     fn matches_subscribe_response(&self, message: &Value, request: &Value) -> Option<Result<()>> {
//!         (message["id"] == request["id"]).then_some(Ok(()))
//!     }
//!
//!     fn matches_subscription(&self, message: &Value, request: &Value) -> bool {
//!         message["topic"] == request["topic"]
//!     }
//!
//!     fn matches_identifier(&self, message: &Value, identifier: &str) -> bool {
//!         message["event"] == identifier
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = ConnectionPool::new(Arc::new(Stream), ClientOptions::new())?;
//!
//!     let handle = pool
//!         .subscribe(
//!             "wss://stream.example.com/ws",
//!             json!({ "op": "subscribe", "id": 1, "topic": "trades" }),
//!             false,
//!             |event: DataEvent<Value>| println!("{}", event.data),
//!             None,
//!         )
//!         .await?;
//!
//!     handle.on_connection_lost(|| println!("connection lost"));
//!     handle.on_connection_restored(|down| println!("restored after {down:?}"));
//!
//!     tokio::signal::ctrl_c().await?;
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`events`] | Connection lifecycle events |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`options`] | Client and socket settings |
//! | [`protocol`] | Bindings, messages, requests, subscriptions |
//! | [`transport`] | Sockets, connections and the pool |
//!
//! # Features
//!
//! - **Connection sharing**: subscriptions combined per connection up to a target
//! - **Self-healing**: reconnect, re-authenticate and batched resubscribe
//! - **Typed events**: handlers receive `DataEvent<T>` deserialized with serde
//! - **Testable**: [`MemorySocketFactory`] runs the full pool without a network

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Connection lifecycle events and listener registries.
pub mod events;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Client and socket options.
pub mod options;

/// Binding hooks, messages, requests and subscriptions.
pub mod protocol;

/// Socket transport, connections and the connection pool.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Event types
pub use events::{ConnectionEvent, EventListeners};

// Identifier types
pub use identifiers::{ListenerId, RequestId, SocketId, SubscriptionId};

// Options
pub use options::{BytesInterpreter, ClientOptions, SocketOptions, TextInterpreter};

// Protocol types
pub use protocol::{ApiBinding, DataEvent, MessageEvent, Subscription};

// Transport types
pub use transport::{
    Connection, ConnectionPool, ConnectionSnapshot, ConnectionStatus, MemorySocket,
    MemorySocketFactory, PoolSnapshot, Socket, SocketFactory, SocketListener, SubscriptionHandle,
    SubscriptionSnapshot, WebSocketFactory,
};

// Cancellation token accepted by subscribe calls
pub use tokio_util::sync::CancellationToken;
