//! Core types for the perpetual-futures trading dashboard
//!
//! This crate defines the data shared by every other crate: subscription
//! keys, the exchange's inbound and outbound frames, typed market-data
//! payloads and the browser WebSocket protocol.

pub mod error;
pub mod market;
pub mod subscription;
pub mod upstream;
pub mod websocket;

pub use error::{DashboardError, DashboardResult};
pub use market::{
    AllMids, BookLevel, Candle, Fill, FundingPayment, L2Book, Liquidation, NonUserCancel, Side,
    Trade, UserEvent, UserFills,
};
pub use subscription::{SubscriptionKey, SubscriptionMethod, SubscriptionRequest};
pub use upstream::{ChannelPayload, ConnectionState, UpstreamMessage};
pub use websocket::{ClientMessage, ErrorCode, ServerMessage};
