//! WebSocket message types for browser clients
//!
//! These types define the protocol between the dashboard server and the
//! browser. Subscriptions are expressed with the same [`SubscriptionKey`]
//! used upstream, so a client asks for `{"type":"l2Book","coin":"BTC"}`
//! exactly as the exchange would.

use serde::{Deserialize, Serialize};

use crate::subscription::SubscriptionKey;
use crate::upstream::{ConnectionState, UpstreamMessage};

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start streaming a channel
    Subscribe { subscription: SubscriptionKey },
    /// Stop streaming a channel
    Unsubscribe { subscription: SubscriptionKey },
    /// Ping to keep connection alive
    Ping {
        /// Client timestamp
        timestamp: i64,
    },
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription confirmed
    Subscribed { subscription: SubscriptionKey },
    /// Unsubscription confirmed
    Unsubscribed { subscription: SubscriptionKey },
    /// Market data for one of the client's subscriptions
    Update {
        subscription: SubscriptionKey,
        message: UpstreamMessage,
    },
    /// Error message
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription: Option<SubscriptionKey>,
    },
    /// Pong response to client ping
    Pong {
        /// Echo back client timestamp
        client_timestamp: i64,
        /// Server timestamp
        server_timestamp: i64,
    },
    /// Upstream connection status change
    ConnectionStatus { status: ConnectionState },
}

/// Error codes for WebSocket errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// The exchange rejected the subscription
    SubscriptionRejected,
    /// Unsubscribe for a channel the client never subscribed to
    NotSubscribed,
    /// Updates were dropped because the client fell behind
    Lagged,
    /// The subscription ended on the server side
    SubscriptionClosed,
    /// Internal server error
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_subscribe_parses() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "subscribe",
            "subscription": { "type": "trades", "coin": "SOL" }
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                subscription: SubscriptionKey::trades("SOL")
            }
        );
    }

    #[test]
    fn test_server_update_shape() {
        let msg = ServerMessage::Update {
            subscription: SubscriptionKey::AllMids,
            message: UpstreamMessage::Error("stale".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "update",
                "subscription": { "type": "allMids" },
                "message": { "channel": "error", "data": "stale" }
            })
        );
    }

    #[test]
    fn test_error_omits_missing_subscription() {
        let msg = ServerMessage::Error {
            code: ErrorCode::InvalidMessage,
            message: "bad".to_string(),
            subscription: None,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({ "type": "error", "code": "invalid_message", "message": "bad" })
        );
    }
}
