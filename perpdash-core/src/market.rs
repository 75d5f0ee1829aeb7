//! Typed market-data payloads carried by the upstream channels
//!
//! Prices and sizes arrive from the exchange as decimal strings
//! (`"65012.5"`) and are decoded straight into [`Decimal`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Convert an exchange timestamp (milliseconds since epoch) to UTC
pub fn millis_to_datetime(ms: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(i64::try_from(ms).ok()?)
}

/// Mid prices for every listed coin (`allMids` channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllMids {
    pub mids: HashMap<String, Decimal>,
}

impl AllMids {
    pub fn mid(&self, coin: &str) -> Option<Decimal> {
        self.mids.get(coin).copied()
    }
}

/// A single price level of the order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub px: Decimal,
    pub sz: Decimal,
    /// Number of resting orders at this level
    pub n: u32,
}

/// Level-2 order book snapshot for one coin (`l2Book` channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Book {
    pub coin: String,
    pub time: u64,
    /// `[bids, asks]`, bids sorted descending and asks ascending by price
    pub levels: (Vec<BookLevel>, Vec<BookLevel>),
}

impl L2Book {
    pub fn bids(&self) -> &[BookLevel] {
        &self.levels.0
    }

    pub fn asks(&self) -> &[BookLevel] {
        &self.levels.1
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.levels.0.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.levels.1.first()
    }

    /// Best ask minus best bid, when both sides are populated
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.px - self.best_bid()?.px)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.time)
    }
}

/// Aggressor side as encoded by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Bid side (buy aggressor)
    #[serde(rename = "B")]
    Buy,
    /// Ask side (sell aggressor)
    #[serde(rename = "A")]
    Sell,
}

/// A public trade (`trades` channel delivers a batch of these)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub coin: String,
    pub side: Side,
    pub px: Decimal,
    pub sz: Decimal,
    pub hash: String,
    pub time: u64,
    pub tid: u64,
    /// `[buyer, seller]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<(String, String)>,
}

impl Trade {
    pub fn notional(&self) -> Decimal {
        self.px * self.sz
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.time)
    }
}

/// One of the account's own fills
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub coin: String,
    pub px: Decimal,
    pub sz: Decimal,
    pub side: Side,
    pub time: u64,
    pub start_position: Decimal,
    /// Human-readable direction, e.g. "Open Long", "Close Short"
    pub dir: String,
    pub closed_pnl: Decimal,
    pub hash: String,
    pub oid: u64,
    pub crossed: bool,
    pub fee: Decimal,
    pub tid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_token: Option<String>,
}

/// Fill batch for an address (`userFills` channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFills {
    /// True for the initial history snapshot sent right after subscribing
    #[serde(default)]
    pub is_snapshot: bool,
    pub user: String,
    pub fills: Vec<Fill>,
}

/// Funding payment applied to an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingPayment {
    pub time: u64,
    pub coin: String,
    pub usdc: Decimal,
    pub szi: Decimal,
    pub funding_rate: Decimal,
}

/// Liquidation affecting the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub lid: u64,
    pub liquidator: String,
    pub liquidated_user: String,
    pub liquidated_ntl_pos: Decimal,
    pub liquidated_account_value: Decimal,
}

/// Order cancelled by the exchange rather than by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonUserCancel {
    pub coin: String,
    pub oid: u64,
}

/// Account event (`user` channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserEvent {
    Fills(Vec<Fill>),
    Funding(FundingPayment),
    Liquidation(Liquidation),
    NonUserCancel(Vec<NonUserCancel>),
}

/// OHLCV candle (`candle` channel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (ms)
    #[serde(rename = "t")]
    pub open_time: u64,
    /// Close time (ms)
    #[serde(rename = "T")]
    pub close_time: u64,
    #[serde(rename = "s")]
    pub coin: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Number of trades in the candle
    #[serde(rename = "n")]
    pub trades: u64,
}
