//! Wire formats for the exchange websocket channels.
//!
//! Every message carries a `type` discriminant; anything unrecognized maps to
//! the `Unknown` variant so a protocol addition never kills a consumer.

use std::collections::HashMap;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

/// A JSON value that may arrive as either a number or a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JsonNumber {
    Float(f64),
    Text(String),
}

impl JsonNumber {
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            JsonNumber::Float(value) => Decimal::from_f64(*value),
            JsonNumber::Text(text) => text.trim().parse::<Decimal>().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsonNumber::Float(value) => Some(*value),
            JsonNumber::Text(text) => text.trim().parse::<f64>().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BookMessage {
    #[serde(rename = "subscribed/order_book")]
    Subscribed(BookPayload),
    #[serde(rename = "update/order_book")]
    Update(BookPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct BookPayload {
    #[serde(default)]
    pub channel: Option<String>,
    pub order_book: RawBook,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawBook {
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

#[derive(Debug, Deserialize)]
pub struct RawLevel {
    pub price: JsonNumber,
    pub size: JsonNumber,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StatsMessage {
    #[serde(rename = "subscribed/user_stats")]
    Subscribed(StatsPayload),
    #[serde(rename = "update/user_stats")]
    Update(StatsPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StatsPayload {
    #[serde(default)]
    pub stats: Option<UserStats>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub available_balance: Option<JsonNumber>,
    #[serde(default)]
    pub portfolio_value: Option<JsonNumber>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AccountMessage {
    #[serde(rename = "subscribed/account_all")]
    Subscribed(AccountPayload),
    #[serde(rename = "update/account_all")]
    Update(AccountPayload),
    #[serde(rename = "update/account")]
    PartialUpdate(AccountPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountPayload {
    #[serde(default)]
    pub positions: HashMap<String, RawPosition>,
    #[serde(default)]
    pub trades: HashMap<String, Vec<RawTrade>>,
}

#[derive(Debug, Deserialize)]
pub struct RawPosition {
    #[serde(default)]
    pub position: Option<JsonNumber>,
    #[serde(default)]
    pub sign: Option<i64>,
}

impl RawPosition {
    /// Signed position size; the feed reports a magnitude plus a sign flag.
    pub fn signed_size(&self) -> Decimal {
        let magnitude = self
            .position
            .as_ref()
            .and_then(JsonNumber::as_decimal)
            .unwrap_or(Decimal::ZERO);
        let sign = self
            .sign
            .unwrap_or(if magnitude.is_sign_negative() { -1 } else { 1 });
        if sign < 0 {
            -magnitude.abs()
        } else {
            magnitude.abs()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTrade {
    #[serde(default)]
    pub trade_id: Option<i64>,
    #[serde(default)]
    pub market_id: Option<i64>,
    #[serde(default)]
    pub price: Option<JsonNumber>,
    #[serde(default)]
    pub size: Option<JsonNumber>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}
