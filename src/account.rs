//! Account state caches: capital (user stats channel) and position + trade
//! ledger (account-wide channel). Each has exactly one writer, its stream
//! consumer task; the controller only ever reads.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::wire::{AccountPayload, RawTrade, UserStats};

pub const TRADE_LEDGER_CAPACITY: usize = 20;

/// Positions smaller than this are treated as flat.
pub fn flat_epsilon() -> Decimal {
    Decimal::new(1, 9)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapitalState {
    pub available: Decimal,
    pub portfolio_value: Decimal,
}

impl CapitalState {
    /// Accepts a report only when both values are strictly positive; the
    /// streams occasionally deliver transient zero rows that must not
    /// overwrite the last good snapshot.
    pub fn validated(available: Decimal, portfolio_value: Decimal) -> Option<Self> {
        if available > Decimal::ZERO && portfolio_value > Decimal::ZERO {
            Some(Self {
                available,
                portfolio_value,
            })
        } else {
            None
        }
    }

    pub fn from_stats(stats: &UserStats) -> Option<Self> {
        let available = stats
            .available_balance
            .as_ref()
            .and_then(|value| value.as_decimal())
            .unwrap_or(Decimal::ZERO);
        let portfolio_value = stats
            .portfolio_value
            .as_ref()
            .and_then(|value| value.as_decimal())
            .unwrap_or(Decimal::ZERO);
        let validated = Self::validated(available, portfolio_value);
        if validated.is_none() {
            warn!(
                %available,
                %portfolio_value,
                "ignoring user stats update with non-positive values"
            );
        }
        validated
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_id: Option<i64>,
    pub market_id: Option<i64>,
    pub price: Option<Decimal>,
    pub size: Option<Decimal>,
    pub kind: Option<String>,
    pub timestamp: i64,
}

impl TradeRecord {
    fn from_raw(raw: &RawTrade) -> Self {
        Self {
            trade_id: raw.trade_id,
            market_id: raw.market_id,
            price: raw.price.as_ref().and_then(|value| value.as_decimal()),
            size: raw.size.as_ref().and_then(|value| value.as_decimal()),
            kind: raw.kind.clone(),
            timestamp: raw.timestamp.unwrap_or(0),
        }
    }
}

/// Signed position for the tracked market plus a bounded most-recent-first
/// fill ledger. The ledger is observability only; money-at-risk decisions use
/// `size` alone.
#[derive(Debug, Clone, Default)]
pub struct PositionState {
    pub size: Decimal,
    pub trades: VecDeque<TradeRecord>,
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        self.size.abs() < flat_epsilon()
    }

    /// Applies an account-wide report: the position entry for `market_id`
    /// (explicit zero when absent — the stream reporting no entry means flat,
    /// not unknown) and any newly observed fills.
    pub fn apply(&mut self, payload: &AccountPayload, market_id: i32) {
        let new_size = payload
            .positions
            .get(&market_id.to_string())
            .map(|position| position.signed_size())
            .unwrap_or(Decimal::ZERO);
        if new_size != self.size {
            info!(market_id, previous = %self.size, size = %new_size, "position update");
        }
        self.size = new_size;

        let mut incoming: Vec<TradeRecord> = payload
            .trades
            .values()
            .flatten()
            .map(TradeRecord::from_raw)
            .collect();
        incoming.sort_by_key(|trade| trade.timestamp);
        for trade in incoming {
            self.merge_trade(trade);
        }
    }

    fn merge_trade(&mut self, trade: TradeRecord) {
        if self.trades.contains(&trade) {
            return;
        }
        info!(
            market_id = trade.market_id.unwrap_or_default(),
            kind = trade.kind.as_deref().unwrap_or("unknown"),
            size = %trade.size.unwrap_or(Decimal::ZERO),
            price = %trade.price.unwrap_or(Decimal::ZERO),
            "trade update"
        );
        self.trades.push_front(trade);
        self.trades.truncate(TRADE_LEDGER_CAPACITY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::JsonNumber;

    fn stats(available: f64, portfolio: f64) -> UserStats {
        UserStats {
            available_balance: Some(JsonNumber::Float(available)),
            portfolio_value: Some(JsonNumber::Float(portfolio)),
        }
    }

    fn trade(id: i64, timestamp: i64) -> RawTrade {
        RawTrade {
            trade_id: Some(id),
            market_id: Some(1),
            price: Some(JsonNumber::Float(100.0)),
            size: Some(JsonNumber::Float(0.5)),
            kind: Some("maker".to_string()),
            timestamp: Some(timestamp),
        }
    }

    fn payload_with_trades(trades: Vec<RawTrade>) -> AccountPayload {
        let mut payload = AccountPayload::default();
        payload.trades.insert("1".to_string(), trades);
        payload
    }

    #[test]
    fn capital_accepts_only_strictly_positive_values() {
        assert!(CapitalState::from_stats(&stats(1000.0, 1010.0)).is_some());
        assert!(CapitalState::from_stats(&stats(-1.0, 1010.0)).is_none());
        assert!(CapitalState::from_stats(&stats(1000.0, 0.0)).is_none());
        assert!(CapitalState::from_stats(&UserStats::default()).is_none());
    }

    #[test]
    fn invalid_capital_update_preserves_previous_state() {
        let mut cache = CapitalState::from_stats(&stats(1000.0, 1010.0));
        if let Some(update) = CapitalState::from_stats(&stats(-1.0, 0.0)) {
            cache = Some(update);
        }
        let cache = cache.unwrap();
        assert_eq!(cache.available, Decimal::from(1000));
        assert_eq!(cache.portfolio_value, Decimal::from(1010));
    }

    #[test]
    fn absent_position_entry_means_flat() {
        let mut state = PositionState {
            size: Decimal::new(5, 1),
            trades: VecDeque::new(),
        };
        state.apply(&AccountPayload::default(), 1);
        assert_eq!(state.size, Decimal::ZERO);
        assert!(state.is_flat());
    }

    #[test]
    fn ledger_deduplicates_and_orders_most_recent_first() {
        let mut state = PositionState::default();
        state.apply(&payload_with_trades(vec![trade(1, 10), trade(2, 20)]), 1);
        // Same fills redelivered plus one new one.
        state.apply(&payload_with_trades(vec![trade(2, 20), trade(3, 30)]), 1);
        let ids: Vec<_> = state.trades.iter().map(|t| t.trade_id).collect();
        assert_eq!(ids, vec![Some(3), Some(2), Some(1)]);
    }

    #[test]
    fn ledger_is_bounded() {
        let mut state = PositionState::default();
        let trades: Vec<RawTrade> = (0..40).map(|i| trade(i, i)).collect();
        state.apply(&payload_with_trades(trades), 1);
        assert_eq!(state.trades.len(), TRADE_LEDGER_CAPACITY);
        // The newest fills survive.
        assert_eq!(state.trades.front().unwrap().trade_id, Some(39));
    }
}
