//! Wire-schema hooks supplied by a concrete API client.
//!
//! The engine never interprets exchange-specific message shapes itself.
//! Everything that depends on the wire schema goes through [`ApiBinding`]:
//! the four matching predicates are required, every other hook has a
//! default suited to unauthenticated, schema-agnostic streams.
//!
//! # Example
//!
//! ```ignore
//! struct Binance;
//!
//! #[async_trait]
//! impl ApiBinding for Binance {
//!     fn matches_query(&self, message: &Value, request: &Value) -> Option<Result<Value>> {
//!         (message["id"] == request["id"]).then(|| Ok(message["result"].clone()))
//!     }
//!
//!     fn matches_subscribe_response(&self, message: &Value, request: &Value) -> Option<Result<()>> {
//!         (message["id"] == request["id"]).then_some(Ok(()))
//!     }
//!
//!     fn matches_subscription(&self, message: &Value, request: &Value) -> bool {
//!         request["params"]
//!             .as_array()
//!             .is_some_and(|topics| topics.contains(&message["stream"]))
//!     }
//!
//!     fn matches_identifier(&self, message: &Value, identifier: &str) -> bool {
//!         message["e"] == identifier
//!     }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::Connection;

// ============================================================================
// ApiBinding
// ============================================================================

/// Schema-specific behavior of a subscription API.
#[async_trait]
pub trait ApiBinding: Send + Sync + 'static {
    /// Matches a query response.
    ///
    /// `None` if `message` does not answer `request`; otherwise the query
    /// result or the server-side error.
    fn matches_query(&self, message: &Value, request: &Value) -> Option<Result<Value>>;

    /// Matches the server's acknowledgement of a subscribe request.
    ///
    /// `None` if unrelated; `Some(Err)` when the server rejected it.
    fn matches_subscribe_response(&self, message: &Value, request: &Value) -> Option<Result<()>>;

    /// Returns `true` if `message` is an update for the subscription created by `request`.
    fn matches_subscription(&self, message: &Value, request: &Value) -> bool;

    /// Returns `true` if `message` belongs to the identifier subscription `identifier`.
    fn matches_identifier(&self, message: &Value, identifier: &str) -> bool;

    /// Authenticates `connection`, typically through
    /// [`Connection::send_and_wait`].
    ///
    /// # Errors
    ///
    /// The default implementation always fails with [`Error::Authentication`].
    async fn authenticate(&self, connection: &Connection) -> Result<()> {
        let _ = connection;
        Err(Error::authentication(
            "authenticated subscriptions are not supported by this API",
        ))
    }

    /// Builds the request that cancels the subscription created by `request`.
    ///
    /// `None` when the API has no unsubscribe message.
    fn unsubscribe_request(&self, request: &Value) -> Option<Value> {
        let _ = request;
        None
    }

    /// Refreshes a subscribe request before it is resent after a reconnect
    /// (new nonce, new listen key, re-signed payload).
    ///
    /// # Errors
    ///
    /// A failure aborts the resubscription and triggers another reconnect.
    async fn revitalize_request(&self, request: Value) -> Result<Value> {
        Ok(request)
    }

    /// Resolves the URL to connect to for `address`.
    ///
    /// # Errors
    ///
    /// A failure aborts the subscribe or query that needed the connection.
    async fn connection_url(&self, address: &str, authenticated: bool) -> Result<String> {
        let _ = authenticated;
        Ok(address.to_string())
    }

    /// Returns a fresh URL to reconnect `connection` to, or `None` to reuse the current one.
    async fn reconnection_url(&self, connection: &Connection) -> Option<String> {
        let _ = connection;
        None
    }

    /// Derives the topic attached to delivered [`crate::DataEvent`]s.
    fn topic(&self, message: &Value) -> Option<String> {
        let _ = message;
        None
    }

    /// Detects a server signal to pause (`Some(true)`) or resume
    /// (`Some(false)`) activity on the connection.
    fn pause_signal(&self, message: &Value) -> Option<bool> {
        let _ = message;
        None
    }

    /// Keep routing a message to subscriptions after it answered a query.
    fn continue_on_query_response(&self) -> bool {
        false
    }

    /// Suppress the warning for messages nothing claimed.
    fn unhandled_message_expected(&self) -> bool {
        false
    }

    /// Called for every message no request or subscription claimed.
    fn unhandled_message(&self, message: &Value) {
        let _ = message;
    }
}
