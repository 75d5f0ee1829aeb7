//! Hyperliquid integration for the trading dashboard
//!
//! This crate owns the single real-time connection to the exchange: connect,
//! fixed-delay reconnect, keep-alive, subscription replay and decoding of
//! inbound frames into [`perpdash_core::UpstreamMessage`].
//!
//! Endpoint and timings can be set through environment variables:
//! - `HYPERLIQUID_WS_URL` - explicit WebSocket endpoint
//! - `HYPERLIQUID_TESTNET` - `true` to use the testnet endpoint
//! - `HYPERLIQUID_RECONNECT_DELAY_MS` / `HYPERLIQUID_PING_INTERVAL_MS`

pub mod websocket;

pub use websocket::{
    HyperliquidUpdate, HyperliquidWebSocket, HyperliquidWebSocketConfig,
    HYPERLIQUID_TESTNET_WS_URL, HYPERLIQUID_WS_URL,
};
