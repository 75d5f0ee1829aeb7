//! Subscription keys and the outbound subscribe/unsubscribe frames
//!
//! A [`SubscriptionKey`] identifies one logical upstream stream. It is both
//! the registry's identity key and the `subscription` payload of the frames
//! sent to the exchange, so its serde shape matches the exchange protocol:
//! `{"type": "l2Book", "coin": "BTC"}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a single upstream channel together with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubscriptionKey {
    /// Mid prices for every listed coin
    AllMids,
    /// Level-2 order book for a coin
    L2Book { coin: String },
    /// Public trades for a coin
    Trades { coin: String },
    /// Account events (fills, funding, liquidations) for an address
    User { user: String },
    /// Fill history and live fills for an address
    UserFills { user: String },
    /// OHLCV candles for a coin at an interval (e.g. "1m", "1h")
    Candle { coin: String, interval: String },
}

impl SubscriptionKey {
    pub fn all_mids() -> Self {
        Self::AllMids
    }

    pub fn l2_book(coin: impl Into<String>) -> Self {
        Self::L2Book { coin: coin.into() }
    }

    pub fn trades(coin: impl Into<String>) -> Self {
        Self::Trades { coin: coin.into() }
    }

    pub fn user(user: impl Into<String>) -> Self {
        Self::User { user: user.into() }
    }

    pub fn user_fills(user: impl Into<String>) -> Self {
        Self::UserFills { user: user.into() }
    }

    pub fn candle(coin: impl Into<String>, interval: impl Into<String>) -> Self {
        Self::Candle {
            coin: coin.into(),
            interval: interval.into(),
        }
    }

    /// Wire name of the channel this key belongs to
    pub fn channel(&self) -> &'static str {
        match self {
            Self::AllMids => "allMids",
            Self::L2Book { .. } => "l2Book",
            Self::Trades { .. } => "trades",
            Self::User { .. } => "user",
            Self::UserFills { .. } => "userFills",
            Self::Candle { .. } => "candle",
        }
    }

    /// Coin parameter, for per-coin channels
    pub fn coin(&self) -> Option<&str> {
        match self {
            Self::L2Book { coin } | Self::Trades { coin } | Self::Candle { coin, .. } => Some(coin),
            _ => None,
        }
    }

    /// Address parameter, for per-user channels
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::User { user } | Self::UserFills { user } => Some(user),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllMids => write!(f, "allMids"),
            Self::L2Book { coin } | Self::Trades { coin } => {
                write!(f, "{}:{}", self.channel(), coin)
            }
            Self::User { user } | Self::UserFills { user } => {
                write!(f, "{}:{}", self.channel(), user)
            }
            Self::Candle { coin, interval } => write!(f, "candle:{}:{}", coin, interval),
        }
    }
}

/// Method field of an outbound subscription frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMethod {
    Subscribe,
    Unsubscribe,
}

/// Frame sent to the exchange to (un)subscribe a channel.
///
/// The same shape is echoed back by the exchange inside a
/// `subscriptionResponse` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub method: SubscriptionMethod,
    pub subscription: SubscriptionKey,
}

impl SubscriptionRequest {
    pub fn subscribe(key: SubscriptionKey) -> Self {
        Self {
            method: SubscriptionMethod::Subscribe,
            subscription: key,
        }
    }

    pub fn unsubscribe(key: SubscriptionKey) -> Self {
        Self {
            method: SubscriptionMethod::Unsubscribe,
            subscription: key,
        }
    }
}
