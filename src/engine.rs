//! Order lifecycle controller. At most one order rests at a time: it is
//! placed, left alone for the reconciliation window, cancelled, and only then
//! does the loop decide whether to flip sides. Fills are never inferred from
//! order status; the position reported by the account stream after the cancel
//! is the only ground truth.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use crate::account::{flat_epsilon, CapitalState, PositionState};
use crate::exchange::{
    next_client_order_id, MarketMetadata, OrderRequest, Side, TradingTransport,
};
use crate::market::MID_FRESHNESS;
use crate::pricing::QuotePricer;
use crate::sizing::SizeCalculator;
use crate::streams::BookStream;

const NO_BOOK_RETRY: Duration = Duration::from_secs(2);
const NO_QUOTE_RETRY: Duration = Duration::from_secs(3);
const PLACEMENT_RETRY_BACKOFF: Duration = Duration::from_secs(5);
const CYCLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
const POST_CYCLE_PAUSE: Duration = Duration::from_secs(2);

/// Relative mid move that makes a resting quote stale.
fn price_move_threshold() -> Decimal {
    Decimal::new(1, 3)
}

#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub client_order_id: i64,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub placed_at: Instant,
}

/// The controller's own state. Nothing else mutates it.
#[derive(Debug, Clone)]
pub struct QuotingState {
    pub side: Side,
    pub last_quoted_mid: Option<Decimal>,
    pub active: Option<ActiveOrder>,
}

impl QuotingState {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            last_quoted_mid: None,
            active: None,
        }
    }
}

/// True when the mid has drifted beyond the threshold since the last quote.
/// No previous mid means the next quote is always fresh enough to place.
pub(crate) fn price_moved(last_quoted_mid: Option<Decimal>, mid: Decimal) -> bool {
    match last_quoted_mid {
        Some(last) if last > Decimal::ZERO => {
            ((mid - last) / last).abs() > price_move_threshold()
        }
        _ => true,
    }
}

/// Side-flip rule, evaluated against the reconciled position after the
/// timeout cancel. A sell cycle that leaves inventory above the notional
/// floor stays on the sell side and re-evaluates next cycle.
pub(crate) fn next_side(
    current: Side,
    position: Decimal,
    mid: Decimal,
    min_notional: Decimal,
) -> Side {
    match current {
        Side::Buy if position > Decimal::ZERO => Side::Sell,
        Side::Sell if position.abs() < flat_epsilon() => Side::Buy,
        Side::Sell if position > Decimal::ZERO && position * mid < min_notional => Side::Buy,
        _ => current,
    }
}

fn is_stream_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_lowercase();
    text.contains("websocket") || text.contains("stream")
}

pub(crate) async fn place_limit_order(
    transport: &dyn TradingTransport,
    metadata: &MarketMetadata,
    side: Side,
    price: Decimal,
    size: Decimal,
) -> Result<ActiveOrder> {
    let client_order_id = next_client_order_id();
    let request = OrderRequest {
        market_id: metadata.market_id,
        client_order_id,
        base_ticks: metadata.scale_amount(size)?,
        price_ticks: metadata.scale_price(price)?,
        side,
        post_only: true,
        reduce_only: side.is_sell(),
    };
    info!(%side, %price, %size, client_order_id, "placing limit order");
    let ack = transport.place_order(request).await?;
    info!(
        client_order_id,
        tx = ack.tx_hash.as_deref().unwrap_or("ok"),
        "order submitted"
    );
    Ok(ActiveOrder {
        client_order_id,
        side,
        price,
        size,
        placed_at: Instant::now(),
    })
}

pub struct Engine {
    transport: Arc<dyn TradingTransport>,
    metadata: MarketMetadata,
    book: BookStream,
    capital_rx: watch::Receiver<Option<CapitalState>>,
    position_rx: watch::Receiver<Option<PositionState>>,
    pricer: QuotePricer,
    sizer: SizeCalculator,
    order_timeout: Duration,
    min_notional: Decimal,
    state: QuotingState,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn TradingTransport>,
        metadata: MarketMetadata,
        book: BookStream,
        capital_rx: watch::Receiver<Option<CapitalState>>,
        position_rx: watch::Receiver<Option<PositionState>>,
        pricer: QuotePricer,
        sizer: SizeCalculator,
        order_timeout: Duration,
        min_notional: Decimal,
        state: QuotingState,
    ) -> Self {
        Self {
            transport,
            metadata,
            book,
            capital_rx,
            position_rx,
            pricer,
            sizer,
            order_timeout,
            min_notional,
            state,
        }
    }

    pub fn has_active_order(&self) -> bool {
        self.state.active.is_some()
    }

    pub fn abort_book_stream(&self) {
        self.book.abort();
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(side = %self.state.side, "starting quoting loop");
        loop {
            if let Err(err) = self.cycle().await {
                error!(error = %format!("{err:#}"), "quoting cycle failed");
                if is_stream_error(&err) {
                    self.book.mark_unhealthy();
                }
                time::sleep(CYCLE_ERROR_BACKOFF).await;
            }
        }
    }

    /// One pass of the control loop. Every sleep is a suspension point after
    /// which caches are re-read; no market or account value is trusted across
    /// one.
    async fn cycle(&mut self) -> Result<()> {
        if !self.book.is_healthy() {
            warn!("order book stream unhealthy, attempting restart");
            if !self.book.restart().await {
                error!("failed to restart order book stream, backing off");
                time::sleep(RECONNECT_BACKOFF).await;
                return Ok(());
            }
        }

        let Some(mid) = self.current_mid() else {
            info!("no order book data yet, sleeping");
            time::sleep(NO_BOOK_RETRY).await;
            return Ok(());
        };

        let side = self.state.side;
        let Some(target_price) = self.pricer.quote(mid, side) else {
            time::sleep(NO_QUOTE_RETRY).await;
            return Ok(());
        };

        let moved = price_moved(self.state.last_quoted_mid, mid);
        let offset_pct = if mid > Decimal::ZERO {
            (target_price - mid) / mid * Decimal::from(100)
        } else {
            Decimal::ZERO
        };
        info!(
            %mid,
            %side,
            target = %target_price,
            offset_pct = %offset_pct,
            price_moved = moved,
            "quote target"
        );

        if self.state.active.is_some() {
            if moved {
                self.cancel_active("price moved").await;
            } else if let Some(order) = &self.state.active {
                info!(
                    client_order_id = order.client_order_id,
                    "order still active, price unchanged"
                );
            }
        }

        if self.state.active.is_none() {
            let capital = self.capital_rx.borrow().clone();
            let position = self.position_size();
            match self.sizer.order_size(side, capital.as_ref(), position, mid) {
                Some(size) if size > Decimal::ZERO => {
                    match place_limit_order(
                        self.transport.as_ref(),
                        &self.metadata,
                        side,
                        target_price,
                        size,
                    )
                    .await
                    {
                        Ok(order) => {
                            self.state.active = Some(order);
                            self.state.last_quoted_mid = Some(mid);
                        }
                        Err(err) => {
                            warn!(
                                error = %format!("{err:#}"),
                                %side,
                                price = %target_price,
                                %size,
                                "order placement failed, backing off"
                            );
                            time::sleep(PLACEMENT_RETRY_BACKOFF).await;
                            return Ok(());
                        }
                    }
                }
                Some(_) => {
                    if side == Side::Buy {
                        warn!("calculated order size is zero, skipping");
                    }
                }
                None => {}
            }
        }

        // Reconciliation window: let the order rest, then cancel whatever is
        // left and read the position stream for what actually filled.
        time::sleep(self.order_timeout).await;

        if self.state.active.is_some() {
            info!("order timeout reached, cancelling and assessing fills");
            self.cancel_active("reconciliation timeout").await;
        }

        let position = self.position_size();
        let next = next_side(self.state.side, position, mid, self.min_notional);
        if next != self.state.side {
            match (self.state.side, next) {
                (Side::Buy, Side::Sell) => {
                    info!(%position, "position opened after buy cycle, switching to sell")
                }
                (Side::Sell, Side::Buy) if position.abs() < flat_epsilon() => {
                    info!("position closed after sell cycle, switching to buy")
                }
                _ => info!(
                    %position,
                    notional = %(position * mid),
                    "position too small to sell, switching to buy to accumulate"
                ),
            }
            self.state.side = next;
        } else {
            info!(%position, side = %self.state.side, "no side change after reconciliation");
        }

        time::sleep(POST_CYCLE_PAUSE).await;
        Ok(())
    }

    fn current_mid(&self) -> Option<Decimal> {
        self.book
            .state()
            .and_then(|book| book.mid_at(Instant::now(), MID_FRESHNESS))
    }

    fn position_size(&self) -> Decimal {
        self.position_rx
            .borrow()
            .as_ref()
            .map(|state| state.size)
            .unwrap_or(Decimal::ZERO)
    }

    /// Cancels via cancel-all: the single-order model means the one resting
    /// order is everything the sub-account has. On failure the order is still
    /// assumed outstanding and the loop moves on.
    async fn cancel_active(&mut self, reason: &str) {
        if let Some(order) = &self.state.active {
            info!(
                client_order_id = order.client_order_id,
                side = %order.side,
                price = %order.price,
                size = %order.size,
                age_secs = order.placed_at.elapsed().as_secs_f64(),
                reason,
                "cancelling resting order"
            );
        }
        match self.transport.cancel_all_orders().await {
            Ok(()) => {
                self.state.active = None;
                info!("cancelled all resting orders");
            }
            Err(err) => error!(?err, "failed to cancel orders"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::PositionState;
    use crate::exchange::{OrderAck, TransportError};
    use crate::market::BookState;
    use crate::pricing::{candidate_paths, QuotePricer};
    use crate::wire::{JsonNumber, RawBook, RawLevel};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Place {
            side: Side,
            reduce_only: bool,
            price_ticks: i64,
            base_ticks: i64,
        },
        CancelAll,
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
        fail_placement: bool,
    }

    #[async_trait]
    impl TradingTransport for RecordingTransport {
        async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, TransportError> {
            if self.fail_placement {
                return Err(TransportError::Connection("no route".to_string()));
            }
            self.calls.lock().unwrap().push(Call::Place {
                side: request.side,
                reduce_only: request.reduce_only,
                price_ticks: request.price_ticks,
                base_ticks: request.base_ticks,
            });
            Ok(OrderAck { tx_hash: None })
        }

        async fn cancel_all_orders(&self) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(Call::CancelAll);
            Ok(())
        }
    }

    fn metadata() -> MarketMetadata {
        MarketMetadata {
            market_id: 1,
            symbol: "PAXG".to_string(),
            price_tick: Decimal::new(1, 2),
            amount_tick: Decimal::new(1, 4),
        }
    }

    fn raw_book(bid: &str, ask: &str) -> RawBook {
        RawBook {
            bids: vec![RawLevel {
                price: JsonNumber::Text(bid.to_string()),
                size: JsonNumber::Text("1".to_string()),
            }],
            asks: vec![RawLevel {
                price: JsonNumber::Text(ask.to_string()),
                size: JsonNumber::Text("1".to_string()),
            }],
        }
    }

    struct Harness {
        engine: Engine,
        transport: Arc<RecordingTransport>,
        book_tx: tokio::sync::watch::Sender<Option<BookState>>,
        capital_tx: tokio::sync::watch::Sender<Option<CapitalState>>,
        position_tx: tokio::sync::watch::Sender<Option<PositionState>>,
    }

    fn harness(side: Side, transport: RecordingTransport) -> Harness {
        let transport = Arc::new(transport);
        let (book_tx, book) = BookStream::stub();
        let (capital_tx, capital_rx) = tokio::sync::watch::channel(None);
        let (position_tx, position_rx) = tokio::sync::watch::channel(None);
        let dir = std::env::temp_dir().join("quoter-engine-tests-missing");
        let pricer = QuotePricer::new(
            candidate_paths(&dir, "NONE"),
            Decimal::from_str("0.00035").unwrap(),
            false,
            Duration::from_secs(900),
        );
        let sizer = SizeCalculator::new(
            true,
            Decimal::from_str("0.047").unwrap(),
            Decimal::from_str("0.99").unwrap(),
            Decimal::from_str("0.01").unwrap(),
            Decimal::from(15),
        );
        let engine = Engine::new(
            transport.clone(),
            metadata(),
            book,
            capital_rx,
            position_rx,
            pricer,
            sizer,
            Duration::from_secs(90),
            Decimal::from(15),
            QuotingState::new(side),
        );
        Harness {
            engine,
            transport,
            book_tx,
            capital_tx,
            position_tx,
        }
    }

    fn publish_book(harness: &Harness, bid: &str, ask: &str) {
        harness
            .book_tx
            .send(Some(BookState::next(
                None,
                &raw_book(bid, ask),
                Instant::now(),
            )))
            .unwrap();
    }

    fn publish_position(harness: &Harness, size: &str) {
        harness
            .position_tx
            .send(Some(PositionState {
                size: Decimal::from_str(size).unwrap(),
                trades: VecDeque::new(),
            }))
            .unwrap();
    }

    #[test]
    fn price_move_threshold_is_relative() {
        let last = Some(Decimal::from(100));
        assert!(!price_moved(last, Decimal::from_str("100.05").unwrap()));
        assert!(price_moved(last, Decimal::from_str("100.2").unwrap()));
        assert!(price_moved(None, Decimal::from(100)));
    }

    #[test]
    fn side_flip_truth_table() {
        let min_notional = Decimal::from(15);
        let flat = Decimal::ZERO;
        // Buy that filled flips to sell.
        assert_eq!(
            next_side(Side::Buy, Decimal::from(5), Decimal::from(4), min_notional),
            Side::Sell
        );
        // Buy with no fill stays.
        assert_eq!(
            next_side(Side::Buy, flat, Decimal::from(4), min_notional),
            Side::Buy
        );
        // Fully sold flips back to buy.
        assert_eq!(
            next_side(Side::Sell, flat, Decimal::from(4), min_notional),
            Side::Buy
        );
        // Inventory worth less than the floor flips back to accumulate.
        assert_eq!(
            next_side(Side::Sell, Decimal::from(5), Decimal::from(2), min_notional),
            Side::Buy
        );
        // Inventory above the floor keeps selling.
        assert_eq!(
            next_side(Side::Sell, Decimal::from(5), Decimal::from(4), min_notional),
            Side::Sell
        );
    }

    #[test]
    fn stream_errors_are_recognized_by_text() {
        assert!(is_stream_error(&anyhow::anyhow!("websocket went away")));
        assert!(is_stream_error(&anyhow::anyhow!(
            "order book stream channel closed"
        )));
        assert!(!is_stream_error(&anyhow::anyhow!("insufficient funds")));
    }

    #[tokio::test(start_paused = true)]
    async fn buy_cycle_places_then_reconciles_and_flips() {
        let mut h = harness(Side::Buy, RecordingTransport::default());
        publish_book(&h, "99.5", "100.5");
        h.capital_tx
            .send(Some(CapitalState {
                available: Decimal::from(1000),
                portfolio_value: Decimal::from(1000),
            }))
            .unwrap();
        // The fill lands on the position stream during the cycle; publishing
        // it up-front is equivalent for the reconciliation read.
        publish_position(&h, "9.801");

        h.engine.cycle().await.unwrap();

        // mid 100, fallback spread => 99.965 => 9996 price ticks; size 9.801
        // => 98010 amount ticks.
        let calls = h.transport.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::Place {
                    side: Side::Buy,
                    reduce_only: false,
                    price_ticks: 9996,
                    base_ticks: 98010,
                },
                Call::CancelAll,
            ]
        );
        assert_eq!(h.engine.state.side, Side::Sell);
        assert!(h.engine.state.active.is_none());
        assert_eq!(h.engine.state.last_quoted_mid, Some(Decimal::from(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn sell_cycle_below_notional_floor_skips_and_flips_to_buy() {
        let mut h = harness(Side::Sell, RecordingTransport::default());
        publish_book(&h, "1.99", "2.01");
        publish_position(&h, "5");

        h.engine.cycle().await.unwrap();

        assert!(h.transport.calls.lock().unwrap().is_empty());
        assert_eq!(h.engine.state.side, Side::Buy);
    }

    #[tokio::test(start_paused = true)]
    async fn sell_cycle_above_notional_floor_quotes_reduce_only() {
        let mut h = harness(Side::Sell, RecordingTransport::default());
        publish_book(&h, "3.99", "4.01");
        publish_position(&h, "5");

        h.engine.cycle().await.unwrap();

        // mid 4, fallback spread => 4.0014 => 400 price ticks (truncated);
        // the whole 5-unit inventory goes out reduce-only.
        let calls = h.transport.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::Place {
                    side: Side::Sell,
                    reduce_only: true,
                    price_ticks: 400,
                    base_ticks: 50000,
                },
                Call::CancelAll,
            ]
        );
        // Nothing filled: still holding 5 units worth 20, stay on sell.
        assert_eq!(h.engine.state.side, Side::Sell);
    }

    #[tokio::test(start_paused = true)]
    async fn placement_failure_leaves_state_untouched() {
        let mut h = harness(
            Side::Buy,
            RecordingTransport {
                fail_placement: true,
                ..Default::default()
            },
        );
        publish_book(&h, "99.5", "100.5");
        publish_position(&h, "0");

        h.engine.cycle().await.unwrap();

        assert!(h.transport.calls.lock().unwrap().is_empty());
        assert_eq!(h.engine.state.side, Side::Buy);
        assert!(h.engine.state.active.is_none());
        assert_eq!(h.engine.state.last_quoted_mid, None);
    }

    #[tokio::test(start_paused = true)]
    async fn resting_order_is_kept_while_price_holds() {
        let mut h = harness(Side::Buy, RecordingTransport::default());
        publish_book(&h, "99.5", "100.5");
        h.capital_tx
            .send(Some(CapitalState {
                available: Decimal::from(1000),
                portfolio_value: Decimal::from(1000),
            }))
            .unwrap();
        publish_position(&h, "0");
        h.engine.state.last_quoted_mid = Some(Decimal::from(100));
        h.engine.state.active = Some(ActiveOrder {
            client_order_id: 7,
            side: Side::Buy,
            price: Decimal::from_str("99.965").unwrap(),
            size: Decimal::from(1),
            placed_at: Instant::now(),
        });

        h.engine.cycle().await.unwrap();

        // Mid unchanged: no replacement placed, only the timeout cancel.
        let calls = h.transport.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![Call::CancelAll]);
        assert_eq!(h.engine.state.side, Side::Buy);
        assert!(h.engine.state.active.is_none());
    }
}
