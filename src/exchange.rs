//! The surface the quoting engine needs from the exchange: market metadata
//! lookup, tick scaling, and the order-submission transport.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_sell(self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// A limit order expressed in native exchange ticks.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market_id: i32,
    pub client_order_id: i64,
    pub base_ticks: i64,
    pub price_ticks: i64,
    pub side: Side,
    pub post_only: bool,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub tx_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("exchange unreachable: {0}")]
    Connection(String),
}

/// Order mutation channel to the exchange. The engine is its only writer and
/// runs a single-order model, so `cancel_all_orders` doubles as the targeted
/// cancel for the one resting order.
#[async_trait]
pub trait TradingTransport: Send + Sync {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, TransportError>;
    async fn cancel_all_orders(&self) -> Result<(), TransportError>;
}

/// Transport that validates and logs order flow without touching the
/// exchange. Live submission plugs in behind the same trait once a signer is
/// wired up.
#[derive(Debug, Default)]
pub struct DryRunTransport;

#[async_trait]
impl TradingTransport for DryRunTransport {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, TransportError> {
        if request.base_ticks <= 0 {
            return Err(TransportError::Rejected(
                "base amount must be positive".to_string(),
            ));
        }
        if request.price_ticks <= 0 {
            return Err(TransportError::Rejected(
                "price must be positive".to_string(),
            ));
        }
        info!(
            market_id = request.market_id,
            client_order_id = request.client_order_id,
            side = %request.side,
            price_ticks = request.price_ticks,
            base_ticks = request.base_ticks,
            post_only = request.post_only,
            reduce_only = request.reduce_only,
            "dry-run: accepted order"
        );
        Ok(OrderAck { tx_hash: None })
    }

    async fn cancel_all_orders(&self) -> Result<(), TransportError> {
        info!("dry-run: cancelled all orders");
        Ok(())
    }
}

/// Client order ids fit a bounded id space: microsecond timestamp folded down
/// to six digits. Collisions are negligible under the single-order model.
pub fn next_client_order_id() -> i64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    (micros % 1_000_000) as i64
}

#[derive(Debug, Clone)]
pub struct MarketMetadata {
    pub market_id: i32,
    pub symbol: String,
    pub price_tick: Decimal,
    pub amount_tick: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderBooksResponse {
    order_books: Vec<OrderBookDetail>,
}

#[derive(Debug, Deserialize)]
struct OrderBookDetail {
    symbol: String,
    market_id: i32,
    supported_price_decimals: u32,
    supported_size_decimals: u32,
}

impl MarketMetadata {
    /// Resolves symbol to numeric market id and tick sizes. Startup is fatal
    /// without this.
    pub async fn resolve(api_url: &str, symbol: &str) -> Result<Self> {
        let url = format!("{api_url}/api/v1/orderBooks");
        let response = reqwest::Client::new()
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch order books from {url}"))?
            .error_for_status()
            .context("order books request was rejected")?
            .json::<OrderBooksResponse>()
            .await
            .context("failed to decode order books response")?;
        Self::from_order_books(response, symbol)
    }

    fn from_order_books(response: OrderBooksResponse, symbol: &str) -> Result<Self> {
        let detail = response
            .order_books
            .into_iter()
            .find(|book| book.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| anyhow!("market {symbol} not found in order books"))?;
        Ok(Self {
            market_id: detail.market_id,
            symbol: detail.symbol,
            price_tick: Decimal::new(1, detail.supported_price_decimals),
            amount_tick: Decimal::new(1, detail.supported_size_decimals),
        })
    }

    pub fn scale_price(&self, price: Decimal) -> Result<i64> {
        scale_by_tick(price, self.price_tick)
    }

    pub fn scale_amount(&self, amount: Decimal) -> Result<i64> {
        scale_by_tick(amount, self.amount_tick)
    }
}

fn scale_by_tick(value: Decimal, tick: Decimal) -> Result<i64> {
    if tick <= Decimal::ZERO {
        return Err(anyhow!("tick size must be positive"));
    }
    (value / tick)
        .trunc()
        .to_i64()
        .ok_or_else(|| anyhow!("value {value} exceeds i64 range when scaled by {tick}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> MarketMetadata {
        MarketMetadata {
            market_id: 1,
            symbol: "PAXG".to_string(),
            price_tick: Decimal::new(1, 2),
            amount_tick: Decimal::new(1, 4),
        }
    }

    #[test]
    fn resolves_metadata_from_order_books_payload() {
        let response: OrderBooksResponse = serde_json::from_str(
            r#"{
                "order_books": [
                    {"symbol": "ETH", "market_id": 0, "supported_price_decimals": 2, "supported_size_decimals": 4},
                    {"symbol": "PAXG", "market_id": 3, "supported_price_decimals": 1, "supported_size_decimals": 3}
                ]
            }"#,
        )
        .unwrap();
        let metadata = MarketMetadata::from_order_books(response, "paxg").unwrap();
        assert_eq!(metadata.market_id, 3);
        assert_eq!(metadata.price_tick, Decimal::new(1, 1));
        assert_eq!(metadata.amount_tick, Decimal::new(1, 3));
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let response: OrderBooksResponse =
            serde_json::from_str(r#"{"order_books": []}"#).unwrap();
        assert!(MarketMetadata::from_order_books(response, "PAXG").is_err());
    }

    #[test]
    fn scales_prices_and_amounts_to_ticks() {
        let metadata = test_metadata();
        assert_eq!(
            metadata.scale_price(Decimal::new(99965, 3)).unwrap(),
            9996
        );
        assert_eq!(
            metadata.scale_amount(Decimal::new(9801, 3)).unwrap(),
            98010
        );
    }

    #[test]
    fn client_order_ids_stay_in_bounded_space() {
        for _ in 0..32 {
            let id = next_client_order_id();
            assert!((0..1_000_000).contains(&id));
        }
    }

    #[tokio::test]
    async fn dry_run_cancel_all_is_idempotent() {
        let transport = DryRunTransport;
        assert!(transport.cancel_all_orders().await.is_ok());
        assert!(transport.cancel_all_orders().await.is_ok());
    }

    #[tokio::test]
    async fn dry_run_rejects_non_positive_sizes() {
        let transport = DryRunTransport;
        let request = OrderRequest {
            market_id: 1,
            client_order_id: 42,
            base_ticks: 0,
            price_ticks: 10,
            side: Side::Buy,
            post_only: true,
            reduce_only: false,
        };
        assert!(matches!(
            transport.place_order(request).await,
            Err(TransportError::Rejected(_))
        ));
    }
}
