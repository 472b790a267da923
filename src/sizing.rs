//! Order sizing. The accumulating side spends a capped fraction of available
//! capital; the reducing side unwinds the whole inventory or nothing at all —
//! partial liquidation below the notional floor would leave dust.

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::account::CapitalState;
use crate::exchange::Side;

/// Dynamic sizes never drop below this many base units.
fn min_dynamic_size() -> Decimal {
    Decimal::new(1, 3)
}

pub struct SizeCalculator {
    dynamic_sizing: bool,
    static_size: Decimal,
    capital_usage: Decimal,
    safety_margin: Decimal,
    min_notional: Decimal,
}

impl SizeCalculator {
    pub fn new(
        dynamic_sizing: bool,
        static_size: Decimal,
        capital_usage: Decimal,
        safety_margin: Decimal,
        min_notional: Decimal,
    ) -> Self {
        Self {
            dynamic_sizing,
            static_size,
            capital_usage,
            safety_margin,
            min_notional,
        }
    }

    /// Size for the next order, or `None` when this cycle should not quote at
    /// all (reducing side with nothing worth selling).
    pub fn order_size(
        &self,
        side: Side,
        capital: Option<&CapitalState>,
        position: Decimal,
        mid: Decimal,
    ) -> Option<Decimal> {
        match side {
            Side::Buy => Some(self.accumulation_size(capital, mid)),
            Side::Sell => self.reduction_size(position, mid),
        }
    }

    fn accumulation_size(&self, capital: Option<&CapitalState>, mid: Decimal) -> Decimal {
        if !self.dynamic_sizing {
            return self.static_size;
        }

        let available = match capital {
            Some(capital) if capital.available > Decimal::ZERO => capital.available,
            _ => {
                warn!(static_size = %self.static_size, "no available capital known, using static size");
                return self.static_size;
            }
        };

        if mid <= Decimal::ZERO {
            warn!(static_size = %self.static_size, "invalid mid price, using static size");
            return self.static_size;
        }

        let usable = available * (Decimal::ONE - self.safety_margin);
        let order_capital = usable * self.capital_usage;
        let size = (order_capital / mid).max(min_dynamic_size());
        info!(%order_capital, %mid, %size, "dynamic sizing");
        size
    }

    fn reduction_size(&self, position: Decimal, mid: Decimal) -> Option<Decimal> {
        if position <= Decimal::ZERO {
            info!("sell side with no inventory, skipping cycle");
            return None;
        }
        let notional = position * mid;
        if notional >= self.min_notional {
            Some(position)
        } else {
            info!(
                %notional,
                min_notional = %self.min_notional,
                "position too small to sell, skipping cycle"
            );
            None
        }
    }
}
