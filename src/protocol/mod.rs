//! Message, request and subscription types.
//!
//! This module holds everything the engine knows about messages without
//! knowing their schema. The schema itself is supplied through
//! [`ApiBinding`].
//!
//! # Routing
//!
//! | Inbound message claimed by | Effect |
//! |----------------------------|--------|
//! | [`PendingRequest`] matcher | Request completes, routing stops (unless configured otherwise) |
//! | Request [`Subscription`] | Handler runs if [`ApiBinding::matches_subscription`] |
//! | Identifier [`Subscription`] | Handler runs if [`ApiBinding::matches_identifier`] |
//! | Nothing | [`ApiBinding::unhandled_message`] + warning |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `binding` | Wire-schema hooks |
//! | `message` | Parsed message and typed data event |
//! | `request` | Outstanding requests and their matchers |
//! | `subscription` | Subscription state |

// ============================================================================
// Submodules
// ============================================================================

/// Wire-schema hooks.
pub mod binding;

/// Parsed message and typed data event.
pub mod message;

/// Outstanding requests.
pub mod request;

/// Subscription state.
pub mod subscription;

// ============================================================================
// Re-exports
// ============================================================================

pub use binding::ApiBinding;
pub use message::{DataEvent, MessageEvent};
pub use request::{PendingRequest, PendingRequests, ResponseMatcher};
pub use subscription::{MessageHandler, Subscription, SubscriptionKind};
