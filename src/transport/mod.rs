//! Socket transport, connections and the connection pool.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ ConnectionPool                                                │
//! │   subscribe / query / unsubscribe / reconnect_all / shutdown  │
//! │                                                               │
//! │   ┌───────────────────────┐     ┌───────────────────────┐     │
//! │   │ Connection            │     │ Connection            │     │
//! │   │  subscriptions        │     │  subscriptions        │     │
//! │   │  pending requests     │ ... │  pending requests     │     │
//! │   │        ▲  │           │     │        ▲  │           │     │
//! │   │ events │  ▼ frames    │     │        │  ▼           │     │
//! │   │  Socket (WebSocket)   │     │  Socket (Memory)      │     │
//! │   └───────────────────────┘     └───────────────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Socket Lifecycle
//!
//! 1. `Socket::connect` - Handshake, then start send/receive/idle loops
//! 2. Connection lost - `on_reconnecting`, reconnect every interval
//! 3. Reconnected - `on_reconnected`, connection resubscribes
//! 4. `Socket::close` - Stop loops, `on_close` fires once
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `socket` | Socket traits and states |
//! | `websocket` | tokio-tungstenite socket with reconnect |
//! | `memory` | In-process socket for tests and simulations |
//! | `throttle` | Send rate limit and throughput windows |
//! | `connection` | Subscriptions and requests over one socket |
//! | `handle` | Caller-side subscription handle |
//! | `pool` | Connection selection and the client API |
//! | `diagnostics` | Serializable snapshots |

// ============================================================================
// Submodules
// ============================================================================

/// Subscriptions and requests multiplexed over one socket.
pub mod connection;

/// Serializable pool, connection and subscription snapshots.
pub mod diagnostics;

/// Caller-side subscription handle.
pub mod handle;

/// In-process socket.
pub mod memory;

/// Connection selection and the client-facing API.
pub mod pool;

/// Socket abstraction.
pub mod socket;

/// Send throttle and throughput measurement.
pub mod throttle;

/// WebSocket implementation of [`Socket`].
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionStatus};
pub use diagnostics::{ConnectionSnapshot, PoolSnapshot, SubscriptionSnapshot};
pub use handle::SubscriptionHandle;
pub use memory::{MemorySocket, MemorySocketFactory, Responder};
pub use pool::ConnectionPool;
pub use socket::{Socket, SocketFactory, SocketListener, SocketState};
pub use websocket::{WebSocket, WebSocketFactory};
