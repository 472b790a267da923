//! Websocket stream consumers. Each of the three feeds runs as its own task
//! that reconnects forever and publishes into a `watch` channel; the channel's
//! consumer task is the sole writer of the cache it feeds.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use anyhow::{anyhow, Result};

use crate::account::{CapitalState, PositionState};
use crate::market::BookState;
use crate::wire::{AccountMessage, BookMessage, StatsMessage};

/// The book is considered dead after this much silence.
pub const BOOK_STALE_AFTER: Duration = Duration::from_secs(30);
/// How long a restart waits for the first fresh snapshot.
pub const RECONNECT_WAIT: Duration = Duration::from_secs(15);
const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Order-book feed plus its health surface. Health is judged from the last
/// update age and the consumer task's liveness; the controller may also mark
/// the stream unhealthy after an error that smells like a transport problem.
pub struct BookStream {
    tx: watch::Sender<Option<BookState>>,
    rx: watch::Receiver<Option<BookState>>,
    task: Option<JoinHandle<()>>,
    ws_url: String,
    market_id: i32,
    marked_unhealthy_at: Option<Instant>,
}

impl BookStream {
    pub fn start(ws_url: String, market_id: i32) -> Self {
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(run_book_stream(tx.clone(), ws_url.clone(), market_id));
        Self {
            tx,
            rx,
            task: Some(task),
            ws_url,
            market_id,
            marked_unhealthy_at: None,
        }
    }

    pub fn state(&self) -> Option<BookState> {
        self.rx.borrow().clone()
    }

    pub fn mark_unhealthy(&mut self) {
        self.marked_unhealthy_at = Some(Instant::now());
    }

    pub fn is_healthy(&self) -> bool {
        let book = match self.state() {
            Some(book) => book,
            None => return false,
        };
        // Data newer than an unhealthy mark counts as recovery; the stream
        // proved itself alive again.
        if let Some(marked_at) = self.marked_unhealthy_at {
            if book.updated_at() <= marked_at {
                return false;
            }
        }
        if let Some(task) = &self.task {
            if task.is_finished() {
                warn!("order book stream task finished unexpectedly");
                return false;
            }
        }
        let age = book.updated_at().elapsed();
        if age > BOOK_STALE_AFTER {
            warn!(age_secs = age.as_secs_f64(), "order book stream is stale");
            false
        } else {
            true
        }
    }

    /// Tears down and respawns the consumer, then waits for a snapshot that
    /// postdates the restart. Returns false when no fresh snapshot arrives in
    /// time; the caller treats that as transient and backs off.
    pub async fn restart(&mut self) -> bool {
        info!("restarting order book stream");
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.marked_unhealthy_at = None;
        let restarted_at = Instant::now();
        self.task = Some(tokio::spawn(run_book_stream(
            self.tx.clone(),
            self.ws_url.clone(),
            self.market_id,
        )));

        let mut rx = self.rx.clone();
        let fresh = rx.wait_for(|state| {
            state
                .as_ref()
                .is_some_and(|book| book.updated_at() >= restarted_at)
        });
        let reconnected = timeout(RECONNECT_WAIT, fresh).await;
        match reconnected {
            Ok(Ok(_)) => {
                info!("order book stream reconnected");
                true
            }
            Ok(Err(_)) | Err(_) => {
                error!("order book stream reconnect timed out");
                false
            }
        }
    }

    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.rx.clone();
        timeout(limit, rx.wait_for(|state| state.is_some()))
            .await
            .map_err(|_| anyhow!("timed out waiting for the first order book snapshot"))?
            .map_err(|_| anyhow!("order book stream channel closed"))?;
        Ok(())
    }

    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (watch::Sender<Option<BookState>>, Self) {
        let (tx, rx) = watch::channel(None);
        let stream = Self {
            tx: tx.clone(),
            rx,
            task: None,
            ws_url: String::new(),
            market_id: 0,
            marked_unhealthy_at: None,
        };
        (tx, stream)
    }
}

/// The two account-scoped feeds: capital (user stats) and position/fills.
pub struct AccountStreams {
    capital_rx: watch::Receiver<Option<CapitalState>>,
    position_rx: watch::Receiver<Option<PositionState>>,
    stats_task: JoinHandle<()>,
    account_task: JoinHandle<()>,
}

impl AccountStreams {
    pub fn start(ws_url: String, account_index: i64, market_id: i32) -> Self {
        let (capital_tx, capital_rx) = watch::channel(None);
        let (position_tx, position_rx) = watch::channel(None);
        let stats_task = tokio::spawn(run_user_stats_stream(
            capital_tx,
            ws_url.clone(),
            account_index,
        ));
        let account_task = tokio::spawn(run_account_all_stream(
            position_tx,
            ws_url,
            account_index,
            market_id,
        ));
        Self {
            capital_rx,
            position_rx,
            stats_task,
            account_task,
        }
    }

    pub fn capital_rx(&self) -> watch::Receiver<Option<CapitalState>> {
        self.capital_rx.clone()
    }

    pub fn position_rx(&self) -> watch::Receiver<Option<PositionState>> {
        self.position_rx.clone()
    }

    pub fn capital(&self) -> Option<CapitalState> {
        self.capital_rx.borrow().clone()
    }

    pub fn position_size(&self) -> rust_decimal::Decimal {
        self.position_rx
            .borrow()
            .as_ref()
            .map(|state| state.size)
            .unwrap_or(rust_decimal::Decimal::ZERO)
    }

    pub async fn wait_capital(&self, limit: Duration) -> Result<()> {
        let mut rx = self.capital_rx.clone();
        timeout(limit, rx.wait_for(|state| state.is_some()))
            .await
            .map_err(|_| anyhow!("timed out waiting for valid account capital"))?
            .map_err(|_| anyhow!("user stats channel closed"))?;
        Ok(())
    }

    pub async fn wait_position(&self, limit: Duration) -> Result<()> {
        let mut rx = self.position_rx.clone();
        timeout(limit, rx.wait_for(|state| state.is_some()))
            .await
            .map_err(|_| anyhow!("timed out waiting for initial position data"))?
            .map_err(|_| anyhow!("account channel closed"))?;
        Ok(())
    }

    /// Blocks until the stream confirms a flat position, used by the startup
    /// auto-liquidation path.
    pub async fn wait_flat(&self, limit: Duration) -> Result<()> {
        let mut rx = self.position_rx.clone();
        timeout(
            limit,
            rx.wait_for(|state| state.as_ref().is_some_and(|position| position.is_flat())),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for the position to close"))?
        .map_err(|_| anyhow!("account channel closed"))?;
        Ok(())
    }

    pub fn abort(&self) {
        self.stats_task.abort();
        self.account_task.abort();
    }
}

async fn run_book_stream(
    tx: watch::Sender<Option<BookState>>,
    ws_url: String,
    market_id: i32,
) {
    let channel = format!("order_book/{market_id}");
    run_subscription(tx.clone(), ws_url, channel, move |tx, text| {
        match serde_json::from_str::<BookMessage>(text) {
            Ok(BookMessage::Subscribed(payload)) | Ok(BookMessage::Update(payload)) => {
                if !channel_matches_market(payload.channel.as_deref(), market_id) {
                    return;
                }
                let now = Instant::now();
                tx.send_modify(|state| {
                    let next = BookState::next(state.as_ref(), &payload.order_book, now);
                    debug!(
                        bid = %next.best_bid().unwrap_or_default(),
                        ask = %next.best_ask().unwrap_or_default(),
                        "order book tick"
                    );
                    *state = Some(next);
                });
            }
            Ok(BookMessage::Ping) => debug!("order book ping"),
            Ok(BookMessage::Unknown) => debug!("ignoring unhandled order book message"),
            Err(err) => warn!(?err, "failed to parse order book message"),
        }
    })
    .await;
}

async fn run_user_stats_stream(
    tx: watch::Sender<Option<CapitalState>>,
    ws_url: String,
    account_index: i64,
) {
    let channel = format!("user_stats/{account_index}");
    run_subscription(tx, ws_url, channel, move |tx, text| {
        match serde_json::from_str::<StatsMessage>(text) {
            Ok(StatsMessage::Subscribed(payload)) | Ok(StatsMessage::Update(payload)) => {
                let stats = payload.stats.unwrap_or_default();
                if let Some(capital) = CapitalState::from_stats(&stats) {
                    info!(
                        account_index,
                        available = %capital.available,
                        portfolio_value = %capital.portfolio_value,
                        "received user stats"
                    );
                    let _ = tx.send(Some(capital));
                }
            }
            Ok(StatsMessage::Ping) => debug!("user stats ping"),
            Ok(StatsMessage::Unknown) => debug!("ignoring unhandled user stats message"),
            Err(err) => warn!(?err, "failed to parse user stats message"),
        }
    })
    .await;
}

async fn run_account_all_stream(
    tx: watch::Sender<Option<PositionState>>,
    ws_url: String,
    account_index: i64,
    market_id: i32,
) {
    let channel = format!("account_all/{account_index}");
    run_subscription(tx, ws_url, channel, move |tx, text| {
        match serde_json::from_str::<AccountMessage>(text) {
            Ok(AccountMessage::Subscribed(payload))
            | Ok(AccountMessage::Update(payload))
            | Ok(AccountMessage::PartialUpdate(payload)) => {
                // The first report of any content publishes a state; absence
                // of the market entry is an explicit flat, not unknown.
                tx.send_modify(|state| {
                    let mut next = state.take().unwrap_or_default();
                    next.apply(&payload, market_id);
                    *state = Some(next);
                });
            }
            Ok(AccountMessage::Ping) => debug!("account stream ping"),
            Ok(AccountMessage::Unknown) => debug!("ignoring unhandled account message"),
            Err(err) => warn!(?err, "failed to parse account message"),
        }
    })
    .await;
}

/// Shared connect/subscribe/read loop: connects, sends the subscription
/// message, dispatches text frames to `handle`, and reconnects after a short
/// pause on any disconnect, forever. Exits only when the receiving side of
/// the channel is gone.
async fn run_subscription<T, F>(
    tx: watch::Sender<T>,
    ws_url: String,
    channel: String,
    mut handle: F,
) where
    T: Send + Sync,
    F: FnMut(&watch::Sender<T>, &str) + Send,
{
    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((mut ws, _)) => {
                let subscribe = json!({"type": "subscribe", "channel": channel}).to_string();
                match ws.send(Message::Text(subscribe)).await {
                    Ok(()) => {
                        info!(%channel, "subscribed");
                        while let Some(message) = ws.next().await {
                            match message {
                                Ok(Message::Text(text)) => handle(&tx, &text),
                                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                                Ok(Message::Close(frame)) => {
                                    warn!(%channel, ?frame, "stream closed");
                                    break;
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    warn!(%channel, ?err, "stream error");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => warn!(%channel, ?err, "failed to send subscription"),
                }
            }
            Err(err) => error!(%channel, ?err, "failed to connect"),
        }

        if tx.is_closed() {
            return;
        }
        time::sleep(STREAM_RECONNECT_DELAY).await;
    }
}

/// Update envelopes echo the channel they belong to, e.g. `order_book:3` or
/// `order_book/3`; an envelope without one is taken at face value.
fn channel_matches_market(channel: Option<&str>, market_id: i32) -> bool {
    let Some(channel) = channel else { return true };
    match channel
        .rsplit(|c: char| c == ':' || c == '/')
        .next()
        .and_then(|suffix| suffix.parse::<i32>().ok())
    {
        Some(id) => id == market_id,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_suffix_selects_market() {
        assert!(channel_matches_market(Some("order_book:3"), 3));
        assert!(channel_matches_market(Some("order_book/3"), 3));
        assert!(!channel_matches_market(Some("order_book:4"), 3));
        assert!(channel_matches_market(Some("order_book"), 3));
        assert!(channel_matches_market(None, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_book_is_unhealthy_and_fresh_book_recovers() {
        let (tx, mut stream) = BookStream::stub();
        assert!(!stream.is_healthy());

        let book = crate::wire::RawBook::default();
        let published_at = Instant::now();
        tx.send(Some(BookState::next(None, &book, published_at)))
            .unwrap();
        // An empty book has no mid, but the update itself counts as liveness.
        assert!(stream.is_healthy());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!stream.is_healthy());

        tx.send(Some(BookState::next(None, &book, Instant::now())))
            .unwrap();
        assert!(stream.is_healthy());

        stream.mark_unhealthy();
        assert!(!stream.is_healthy());

        // Data arriving after the mark proves the stream recovered.
        tokio::time::advance(Duration::from_secs(1)).await;
        tx.send(Some(BookState::next(None, &book, Instant::now())))
            .unwrap();
        assert!(stream.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_times_out_without_an_endpoint() {
        let (_tx, mut stream) = BookStream::stub();
        stream.ws_url = "ws://127.0.0.1:9".to_string();
        stream.mark_unhealthy();
        assert!(!stream.restart().await);
        // A failed restart clears the manual mark but the stream stays
        // unhealthy until data actually flows.
        assert!(!stream.is_healthy());
    }
}
