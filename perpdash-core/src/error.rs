//! Error types for the dashboard

use thiserror::Error;

use crate::subscription::SubscriptionKey;

/// Dashboard-wide error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DashboardError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The exchange refused a specific subscription
    #[error("Subscription rejected ({key}): {message}")]
    SubscriptionRejected {
        key: SubscriptionKey,
        message: String,
    },

    /// The consumer fell behind and `skipped` messages for `key` were dropped
    #[error("Subscription lagged ({key}): {skipped} messages skipped")]
    Lagged { key: SubscriptionKey, skipped: u64 },

    #[error("Connection closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DashboardError {
    pub fn network(msg: impl Into<String>) -> Self {
        DashboardError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        DashboardError::Parse(msg.into())
    }

    pub fn rejected(key: SubscriptionKey, message: impl Into<String>) -> Self {
        DashboardError::SubscriptionRejected {
            key,
            message: message.into(),
        }
    }

    pub fn lagged(key: SubscriptionKey, skipped: u64) -> Self {
        DashboardError::Lagged { key, skipped }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DashboardError::Config(msg.into())
    }
}

/// Result type alias for dashboard operations
pub type DashboardResult<T> = Result<T, DashboardError>;
