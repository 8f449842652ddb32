//! Transport abstraction.
//!
//! A [`Socket`] owns one full-duplex connection to a single URL and keeps it
//! alive: it reconnects on loss and reports every lifecycle step to its
//! [`SocketListener`]. The engine only talks to sockets through these traits,
//! so tests and custom transports plug in through a [`SocketFactory`].
//!
//! # Lifecycle
//!
//! ```text
//!  connect() ──► on_open ──► on_message* ──► (loss) ──► on_reconnecting
//!                                  ▲                          │
//!                                  └────── on_reconnected ◄───┘
//!
//!  close() / loss without auto-reconnect ──► on_close (exactly once)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::identifiers::SocketId;
use crate::options::SocketOptions;

// ============================================================================
// SocketState
// ============================================================================

/// Observable state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Never connected.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected and processing.
    Open,
    /// Connection lost, reconnecting.
    Reconnecting,
    /// Close requested.
    Closing,
    /// Closed for good.
    Closed,
}

// ============================================================================
// SocketListener
// ============================================================================

/// Receives socket lifecycle callbacks.
///
/// Callbacks run on the socket's processing task and must not block.
#[async_trait]
pub trait SocketListener: Send + Sync {
    /// The initial connect succeeded.
    fn on_open(&self);

    /// A decoded text message arrived.
    fn on_message(&self, message: String);

    /// A send or receive failed. The socket decides whether to reconnect.
    fn on_error(&self, error: &Error);

    /// The socket closed and will not reconnect.
    fn on_close(&self);

    /// The connection dropped and a reconnect is starting.
    fn on_reconnecting(&self);

    /// The reconnect succeeded.
    fn on_reconnected(&self);

    /// Supplies a new URL before reconnecting, or `None` to keep the current one.
    async fn reconnection_url(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A self-healing full-duplex connection.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Returns the socket ID, stable across reconnects.
    fn id(&self) -> SocketId;

    /// Returns the URL currently in use.
    fn url(&self) -> String;

    /// Returns `true` while connected.
    fn is_open(&self) -> bool;

    /// Returns `true` once closed for good.
    fn is_closed(&self) -> bool;

    /// Sets the listener receiving lifecycle callbacks.
    fn set_listener(&self, listener: Weak<dyn SocketListener>);

    /// Connects and starts processing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] or [`Error::ConnectionTimeout`] if the
    /// handshake fails.
    async fn connect(&self) -> Result<()>;

    /// Queues a text frame. Returns `false` if the socket no longer accepts frames.
    fn send(&self, data: String) -> bool;

    /// Drops the current connection so the reconnect path runs.
    async fn reconnect(&self);

    /// Closes the socket. Idempotent.
    async fn close(&self);

    /// Inbound throughput over the last few seconds, in kilobytes per second.
    fn incoming_kbps(&self) -> f64;
}

// ============================================================================
// SocketFactory
// ============================================================================

/// Creates sockets for the pool.
pub trait SocketFactory: Send + Sync {
    /// Creates an unconnected socket for `url`.
    fn create(&self, url: &str, options: &SocketOptions) -> Arc<dyn Socket>;
}
