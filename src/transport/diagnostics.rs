//! Serializable point-in-time views of the pool, its connections and
//! their subscriptions.

use serde::Serialize;
use serde_json::Value;

use crate::identifiers::{SocketId, SubscriptionId};
use crate::protocol::Subscription;
use crate::transport::connection::ConnectionStatus;

/// State of one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub user_subscription: bool,
    pub authenticated: bool,
    pub confirmed: bool,
    pub closed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl SubscriptionSnapshot {
    pub(crate) fn of(subscription: &Subscription) -> Self {
        Self {
            id: subscription.id(),
            user_subscription: subscription.is_user_subscription(),
            authenticated: subscription.is_authenticated(),
            confirmed: subscription.is_confirmed(),
            closed: subscription.is_closed(),
            request: subscription.request(),
            identifier: subscription.identifier().map(str::to_string),
        }
    }
}

/// State of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: SocketId,
    pub tag: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub authenticated: bool,
    pub paused: bool,
    pub user_subscriptions: usize,
    pub pending_requests: usize,
    pub incoming_kbps: f64,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

/// State of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub connections: Vec<ConnectionSnapshot>,
    pub subscriptions: usize,
    pub incoming_kbps: f64,
}
