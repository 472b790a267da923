//! Startup and shutdown sequencing: resolve the market, clean the slate,
//! bring the streams up, settle any pre-existing position, then hand the
//! reins to the engine. Cleanup runs no matter which step failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::balance;
use crate::config::Config;
use crate::engine::{place_limit_order, Engine, QuotingState};
use crate::exchange::{MarketMetadata, Side, TradingTransport};
use crate::market::MID_FRESHNESS;
use crate::pricing::{candidate_paths, QuotePricer};
use crate::sizing::SizeCalculator;
use crate::streams::{AccountStreams, BookStream};
use tokio::task::JoinHandle;

const READINESS_TIMEOUT: Duration = Duration::from_secs(30);
const LIQUIDATION_TIMEOUT: Duration = Duration::from_secs(60);
const STARTUP_SETTLE: Duration = Duration::from_secs(3);

pub struct Quoter {
    engine: Engine,
    account: AccountStreams,
    balance_task: JoinHandle<()>,
    transport: Arc<dyn TradingTransport>,
}

impl Quoter {
    pub async fn start(config: Config, transport: Arc<dyn TradingTransport>) -> Result<Self> {
        info!(
            symbol = %config.market_symbol,
            account_index = config.account_index,
            api_key_index = config.api_key_index,
            "market maker starting"
        );

        let metadata = MarketMetadata::resolve(&config.api_url, &config.market_symbol)
            .await
            .with_context(|| {
                format!("could not resolve market metadata for {}", config.market_symbol)
            })?;
        info!(
            market_id = metadata.market_id,
            symbol = %metadata.symbol,
            price_tick = %metadata.price_tick,
            amount_tick = %metadata.amount_tick,
            "resolved market metadata"
        );

        // Clean slate: anything resting from a previous run is unknown state.
        transport
            .cancel_all_orders()
            .await
            .context("failed to cancel existing orders at startup")?;
        time::sleep(STARTUP_SETTLE).await;

        let book = BookStream::start(config.ws_url.clone(), metadata.market_id);
        let account = AccountStreams::start(
            config.ws_url.clone(),
            config.account_index,
            metadata.market_id,
        );

        let state = match initial_state(&config, transport.as_ref(), &metadata, &book, &account)
            .await
        {
            Ok(state) => state,
            Err(err) => {
                book.abort();
                account.abort();
                return Err(err);
            }
        };

        let pricer = QuotePricer::new(
            candidate_paths(&config.params_dir, &config.market_symbol),
            config.static_spread,
            config.require_params,
            config.params_refresh,
        );
        let sizer = SizeCalculator::new(
            config.dynamic_sizing,
            config.static_order_size,
            config.capital_usage,
            config.safety_margin,
            config.min_notional,
        );
        let engine = Engine::new(
            transport.clone(),
            metadata,
            book,
            account.capital_rx(),
            account.position_rx(),
            pricer,
            sizer,
            config.order_timeout,
            config.min_notional,
            state,
        );
        let balance_task = balance::spawn(
            config.log_dir.clone(),
            account.capital_rx(),
            account.position_rx(),
        );

        Ok(Self {
            engine,
            account,
            balance_task,
            transport,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.engine.run().await
    }

    /// Cleanup path shared by normal shutdown and startup failure: stop the
    /// background tasks, pull any resting order, release the transport.
    pub async fn shutdown(&mut self) {
        info!("cleanup starting");
        self.balance_task.abort();
        self.account.abort();
        if self.engine.has_active_order() {
            info!("cancelling open order before exit");
            if let Err(err) = self.transport.cancel_all_orders().await {
                warn!(?err, "failed to cancel open order during shutdown");
            }
        }
        self.engine.abort_book_stream();
        info!("market maker stopped");
    }
}

/// Blocks on the three readiness signals, then derives the starting quoting
/// state from whatever position survived the previous run.
async fn initial_state(
    config: &Config,
    transport: &dyn TradingTransport,
    metadata: &MarketMetadata,
    book: &BookStream,
    account: &AccountStreams,
) -> Result<QuotingState> {
    info!("waiting for initial order book, capital, and position data");
    book.wait_ready(READINESS_TIMEOUT).await?;
    info!(market_id = metadata.market_id, "order book stream ready");

    account.wait_capital(READINESS_TIMEOUT).await?;
    if let Some(capital) = account.capital() {
        info!(
            available = %capital.available,
            portfolio_value = %capital.portfolio_value,
            "received valid account capital"
        );
    }

    account.wait_position(READINESS_TIMEOUT).await?;
    let position = account.position_size();
    info!(%position, "received initial position data");

    let mid = book
        .state()
        .and_then(|state| state.mid_at(Instant::now(), MID_FRESHNESS));

    if config.close_long_on_startup {
        if position > Decimal::ZERO {
            if let Some(mid) = mid {
                info!(%position, "closing pre-existing long position at startup");
                let price = mid * (Decimal::ONE + config.static_spread);
                match place_limit_order(transport, metadata, Side::Sell, price, position).await {
                    Ok(order) => {
                        info!("reduce-only sell placed, waiting for stream-confirmed close");
                        account
                            .wait_flat(LIQUIDATION_TIMEOUT)
                            .await
                            .context("pre-existing position did not close")?;
                        info!("position closed");
                        return Ok(QuotingState {
                            side: Side::Sell,
                            last_quoted_mid: Some(mid),
                            active: Some(order),
                        });
                    }
                    Err(err) => {
                        warn!(
                            error = %format!("{err:#}"),
                            "failed to place position-closing order"
                        );
                    }
                }
            } else {
                warn!("no fresh mid price yet, skipping auto-close this boot");
            }
        }
        return Ok(QuotingState::new(Side::Buy));
    }

    if position > Decimal::ZERO {
        return Ok(match mid {
            Some(mid) => {
                let notional = position * mid;
                if notional < config.min_notional {
                    info!(%notional, "existing position below notional floor, starting in buy mode");
                    QuotingState::new(Side::Buy)
                } else {
                    info!(%notional, "existing position detected, starting in sell mode");
                    QuotingState::new(Side::Sell)
                }
            }
            None => {
                warn!("could not value existing position, defaulting to sell mode");
                QuotingState::new(Side::Sell)
            }
        });
    }

    Ok(QuotingState::new(Side::Buy))
}
