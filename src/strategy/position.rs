//! Base-asset position, cost basis and trade statistics.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exchange::Side;
use crate::utils::safe_div;

/// Closed-trade statistics. A sell that realizes PnL counts as one round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub round_trips: u64,
    pub wins: u64,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
}

impl TradeStats {
    pub fn win_rate(&self) -> Decimal {
        safe_div(Decimal::from(self.wins), Decimal::from(self.round_trips))
    }

    /// Gross profit over gross loss; zero when there were no losses.
    pub fn profit_factor(&self) -> Decimal {
        safe_div(self.gross_profit, self.gross_loss)
    }

    fn record(&mut self, pnl: Decimal) {
        self.round_trips += 1;
        if pnl > Decimal::ZERO {
            self.wins += 1;
            self.gross_profit += pnl;
        } else {
            self.gross_loss += -pnl;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Base held across spot and earn
    pub quantity: Decimal,
    pub average_cost: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub mark_price: Decimal,
    pub stats: TradeStats,
}

impl Position {
    /// Rebuild from exchange balances. Persisted cost basis and PnL are only
    /// kept when they are consistent with a non-empty position.
    pub fn rehydrate(quantity: Decimal, price: Decimal, persisted: Option<&Position>) -> Self {
        let mut position = Position {
            quantity,
            average_cost: price,
            ..Default::default()
        };
        if let Some(saved) = persisted {
            position.realized_pnl = saved.realized_pnl;
            position.stats = saved.stats;
            if saved.average_cost > Decimal::ZERO && quantity > Decimal::ZERO {
                position.average_cost = saved.average_cost;
            }
        }
        if quantity.is_zero() {
            position.average_cost = Decimal::ZERO;
        }
        position.mark(price);
        position
    }

    /// Apply a fill. Buys move the average cost, sells realize PnL on the
    /// quantity actually held.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        if quantity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        match side {
            Side::Buy => {
                let cost = self.quantity * self.average_cost + quantity * price;
                self.quantity += quantity;
                self.average_cost = safe_div(cost, self.quantity);
                debug!(%quantity, %price, average_cost = %self.average_cost, "Position increased");
                Decimal::ZERO
            }
            Side::Sell => {
                let matched = quantity.min(self.quantity.max(Decimal::ZERO));
                let pnl = (price - self.average_cost) * matched;
                self.quantity -= quantity;
                if self.quantity <= Decimal::ZERO {
                    self.average_cost = Decimal::ZERO;
                }
                if matched > Decimal::ZERO {
                    self.realized_pnl += pnl;
                    self.stats.record(pnl);
                }
                debug!(%quantity, %price, %pnl, realized = %self.realized_pnl, "Position reduced");
                pnl
            }
        }
    }

    /// Update unrealized PnL at `price`.
    pub fn mark(&mut self, price: Decimal) {
        self.mark_price = price;
        self.unrealized_pnl = (price - self.average_cost) * self.quantity;
    }

    /// Replace the quantity with the exchange's figure, keeping the cost basis.
    pub fn resync_quantity(&mut self, quantity: Decimal, price: Decimal) {
        warn!(tracked = %self.quantity, exchange = %quantity, "Position resynced from exchange");
        if self.quantity <= Decimal::ZERO {
            self.average_cost = price;
        }
        self.quantity = quantity;
        if quantity <= Decimal::ZERO {
            self.average_cost = Decimal::ZERO;
        }
        self.mark(price);
    }
}
