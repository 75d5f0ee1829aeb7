//! Inbound frames from the exchange's real-time feed
//!
//! Every inbound frame has the shape `{"channel": <name>, "data": <payload>}`
//! and decodes into one [`UpstreamMessage`] variant. Market-data variants know
//! which [`SubscriptionKey`] they belong to, which is what the fan-out layer
//! routes on.

use serde::{Deserialize, Serialize};

use crate::error::{DashboardError, DashboardResult};
use crate::market::{AllMids, Candle, L2Book, Trade, UserEvent, UserFills};
use crate::subscription::{SubscriptionKey, SubscriptionRequest};

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "data", rename_all = "camelCase")]
pub enum UpstreamMessage {
    AllMids(AllMids),
    L2Book(L2Book),
    Trades(Vec<Trade>),
    User(UserEvent),
    UserFills(UserFills),
    Candle(Candle),
    /// Acknowledgement of a subscribe/unsubscribe request
    SubscriptionResponse(SubscriptionRequest),
    /// Reply to a JSON `{"method":"ping"}`
    Pong,
    /// Error reported by the exchange, e.g. `Invalid subscription {...}`
    Error(String),
}

impl UpstreamMessage {
    /// Decode one text frame
    pub fn decode(text: &str) -> DashboardResult<Self> {
        serde_json::from_str(text).map_err(|e| DashboardError::parse(e.to_string()))
    }

    /// Whether this frame carries market data for consumers
    pub fn is_market_data(&self) -> bool {
        !matches!(
            self,
            Self::SubscriptionResponse(_) | Self::Pong | Self::Error(_)
        )
    }

    /// The key this message is routed on.
    ///
    /// Returns `None` for control frames, for `user` events (the exchange does
    /// not echo the address back), for empty trade batches and for trade
    /// batches that mix coins.
    pub fn subscription_key(&self) -> Option<SubscriptionKey> {
        match self {
            Self::AllMids(_) => Some(SubscriptionKey::AllMids),
            Self::L2Book(book) => Some(SubscriptionKey::l2_book(&book.coin)),
            Self::Trades(trades) => {
                let coin = &trades.first()?.coin;
                trades
                    .iter()
                    .all(|t| &t.coin == coin)
                    .then(|| SubscriptionKey::trades(coin))
            }
            Self::UserFills(fills) => Some(SubscriptionKey::user_fills(&fills.user)),
            Self::Candle(candle) => Some(SubscriptionKey::candle(&candle.coin, &candle.interval)),
            Self::User(_) | Self::SubscriptionResponse(_) | Self::Pong | Self::Error(_) => None,
        }
    }

    /// For an `error` frame naming a subscription, the key it rejected
    pub fn rejected_subscription(&self) -> Option<SubscriptionKey> {
        let Self::Error(text) = self else {
            return None;
        };
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end < start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    }
}

/// Extracts a typed payload from an [`UpstreamMessage`].
///
/// Implemented for each channel's payload type so a downstream handle can
/// yield `L2Book`, `Vec<Trade>` etc. directly.
pub trait ChannelPayload: Sized + Send + 'static {
    fn from_message(message: &UpstreamMessage) -> Option<Self>;
}

impl ChannelPayload for UpstreamMessage {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        Some(message.clone())
    }
}

impl ChannelPayload for AllMids {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::AllMids(mids) => Some(mids.clone()),
            _ => None,
        }
    }
}

impl ChannelPayload for L2Book {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::L2Book(book) => Some(book.clone()),
            _ => None,
        }
    }
}

impl ChannelPayload for Vec<Trade> {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::Trades(trades) => Some(trades.clone()),
            _ => None,
        }
    }
}

impl ChannelPayload for UserEvent {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::User(event) => Some(event.clone()),
            _ => None,
        }
    }
}

impl ChannelPayload for UserFills {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::UserFills(fills) => Some(fills.clone()),
            _ => None,
        }
    }
}

impl ChannelPayload for Candle {
    fn from_message(message: &UpstreamMessage) -> Option<Self> {
        match message {
            UpstreamMessage::Candle(candle) => Some(candle.clone()),
            _ => None,
        }
    }
}

/// Lifecycle of the upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; a reconnect may be scheduled
    Disconnected,
    /// Handshake in flight
    Connecting,
    /// Connected and receiving data
    Connected,
    /// Shut down explicitly, never reconnects
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::UserEvent;
    use crate::subscription::SubscriptionMethod;

    #[test]
    fn test_decode_all_mids() {
        let msg = UpstreamMessage::decode(
            r#"{"channel":"allMids","data":{"mids":{"BTC":"65000.5","ETH":"3400.1"}}}"#,
        )
        .unwrap();
        assert_eq!(msg.subscription_key(), Some(SubscriptionKey::AllMids));
        assert!(msg.is_market_data());
    }

    #[test]
    fn test_trades_key_comes_from_coin() {
        let msg = UpstreamMessage::decode(
            r#"{"channel":"trades","data":[
                {"coin":"SOL","side":"B","px":"142.1","sz":"3","hash":"0x1","time":1,"tid":1},
                {"coin":"SOL","side":"A","px":"142.0","sz":"1","hash":"0x2","time":2,"tid":2}
            ]}"#,
        )
        .unwrap();
        assert_eq!(msg.subscription_key(), Some(SubscriptionKey::trades("SOL")));
    }

    #[test]
    fn test_empty_or_mixed_trade_batches_have_no_key() {
        let empty = UpstreamMessage::Trades(vec![]);
        assert_eq!(empty.subscription_key(), None);

        let mixed = UpstreamMessage::decode(
            r#"{"channel":"trades","data":[
                {"coin":"SOL","side":"B","px":"1","sz":"1","hash":"0x1","time":1,"tid":1},
                {"coin":"ETH","side":"B","px":"1","sz":"1","hash":"0x2","time":1,"tid":2}
            ]}"#,
        )
        .unwrap();
        assert_eq!(mixed.subscription_key(), None);
    }

    #[test]
    fn test_user_fills_and_candle_keys() {
        let fills = UpstreamMessage::decode(
            r#"{"channel":"userFills","data":{"isSnapshot":true,"user":"0xabc","fills":[]}}"#,
        )
        .unwrap();
        assert_eq!(fills.subscription_key(), Some(SubscriptionKey::user_fills("0xabc")));

        let candle = UpstreamMessage::decode(
            r#"{"channel":"candle","data":{"t":0,"T":59999,"s":"ETH","i":"1m","o":"1","c":"1","h":"1","l":"1","v":"0","n":0}}"#,
        )
        .unwrap();
        assert_eq!(candle.subscription_key(), Some(SubscriptionKey::candle("ETH", "1m")));
    }

    #[test]
    fn test_user_events_have_no_address() {
        let msg = UpstreamMessage::decode(
            r#"{"channel":"user","data":{"nonUserCancel":[{"coin":"BTC","oid":5}]}}"#,
        )
        .unwrap();
        assert!(matches!(msg, UpstreamMessage::User(UserEvent::NonUserCancel(_))));
        assert_eq!(msg.subscription_key(), None);
    }

    #[test]
    fn test_control_frames() {
        let pong = UpstreamMessage::decode(r#"{"channel":"pong"}"#).unwrap();
        assert_eq!(pong, UpstreamMessage::Pong);
        assert!(!pong.is_market_data());

        let ack = UpstreamMessage::decode(
            r#"{"channel":"subscriptionResponse","data":{"method":"subscribe","subscription":{"type":"l2Book","coin":"BTC"}}}"#,
        )
        .unwrap();
        match ack {
            UpstreamMessage::SubscriptionResponse(req) => {
                assert_eq!(req.method, SubscriptionMethod::Subscribe);
                assert_eq!(req.subscription, SubscriptionKey::l2_book("BTC"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejected_subscription_is_parsed_from_error() {
        let msg = UpstreamMessage::decode(
            r#"{"channel":"error","data":"Invalid subscription {\"type\":\"l2Book\",\"coin\":\"NOPE\"}"}"#,
        )
        .unwrap();
        assert_eq!(msg.rejected_subscription(), Some(SubscriptionKey::l2_book("NOPE")));

        let unrelated = UpstreamMessage::Error("Websocket rate limited".to_string());
        assert_eq!(unrelated.rejected_subscription(), None);
    }

    #[test]
    fn test_malformed_frames_fail_to_decode() {
        assert!(UpstreamMessage::decode("not json").is_err());
        assert!(UpstreamMessage::decode(r#"{"channel":"l2Book","data":{"coin":"BTC"}}"#).is_err());
        assert!(UpstreamMessage::decode(r#"{"channel":"bogus","data":{}}"#).is_err());
    }

    #[test]
    fn test_typed_extraction() {
        let msg = UpstreamMessage::AllMids(AllMids {
            mids: Default::default(),
        });
        assert!(AllMids::from_message(&msg).is_some());
        assert!(L2Book::from_message(&msg).is_none());
        assert!(<Vec<Trade>>::from_message(&msg).is_none());
    }
}
