//! Market state cache: the latest order-book snapshot and its derived mid
//! price. Written only by the order-book stream consumer; everyone else reads.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::wire::RawBook;

/// A cached mid is served as long as the book has updated this recently;
/// beyond that the mid is recomputed from the raw sides.
pub const MID_FRESHNESS: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone)]
pub struct BookState {
    bids: Vec<Level>,
    asks: Vec<Level>,
    cached_mid: Option<Decimal>,
    updated_at: Instant,
}

impl BookState {
    /// Folds a raw snapshot over the previous state. The book itself is
    /// replaced wholesale; the cached mid survives an update with an empty
    /// side, so a stale-but-present mid is preferred over none.
    pub fn next(previous: Option<&BookState>, book: &RawBook, now: Instant) -> Self {
        let bids = parse_levels(&book.bids);
        let asks = parse_levels(&book.asks);
        let cached_mid = direct_mid(&bids, &asks)
            .or_else(|| previous.and_then(|state| state.cached_mid));
        Self {
            bids,
            asks,
            cached_mid,
            updated_at: now,
        }
    }

    pub fn updated_at(&self) -> Instant {
        self.updated_at
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        best_price(&self.bids)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        best_price(&self.asks)
    }

    /// Mid price policy: the cached mid while the book is fresh, a direct
    /// recompute from the raw sides otherwise, `None` when neither works.
    pub fn mid_at(&self, now: Instant, freshness: Duration) -> Option<Decimal> {
        if let Some(mid) = self.cached_mid {
            if now.saturating_duration_since(self.updated_at) < freshness {
                return Some(mid);
            }
        }
        direct_mid(&self.bids, &self.asks)
    }
}

fn parse_levels(raw: &[crate::wire::RawLevel]) -> Vec<Level> {
    raw.iter()
        .filter_map(|level| {
            Some(Level {
                price: level.price.as_decimal()?,
                size: level.size.as_decimal()?,
            })
        })
        .collect()
}

fn best_price(levels: &[Level]) -> Option<Decimal> {
    levels
        .iter()
        .find(|level| level.price > Decimal::ZERO && level.size > Decimal::ZERO)
        .map(|level| level.price)
}

fn direct_mid(bids: &[Level], asks: &[Level]) -> Option<Decimal> {
    match (best_price(bids), best_price(asks)) {
        (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
        _ => None,
    }
}
