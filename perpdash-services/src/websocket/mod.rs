//! WebSocket infrastructure for real-time market data
//!
//! The subscription registry fans upstream messages out to downstream
//! handles; the connection handler bridges those handles to browser clients.

mod handler;
mod stream;
mod subscription;

pub use handler::{ClientId, WebSocketState};
pub use stream::Subscription;
pub use subscription::{ConsumerId, SubscriptionManager, UpstreamControl};
