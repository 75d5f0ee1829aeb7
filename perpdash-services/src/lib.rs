//! Market-data services for the trading dashboard
//!
//! This crate multiplexes the single Hyperliquid connection into many
//! downstream subscriptions and serves them to browser clients.

pub mod multiplexer;
pub mod websocket;

pub use multiplexer::{
    ConnectionHealth, MarketDataMultiplexer, MultiplexerConfig, MultiplexerHealth,
    DEFAULT_CANDLE_INTERVAL,
};
pub use websocket::{
    ClientId, ConsumerId, Subscription, SubscriptionManager, UpstreamControl, WebSocketState,
};
