//! S1 trend filter over the 52-day high/low range.
//!
//! The range position of the current price is mapped to a scaling factor in
//! [0, 1] that multiplies the permitted absolute position. The mapping is
//! selected by configuration:
//! - `momentum`: scale = range position, more exposure near the high
//! - `mean_reversion`: scale = 1 - range position, more exposure near the low

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::config::{S1Config, S1Policy};
use crate::exchange::{PriceSnapshot, Side};
use crate::market::CandleWindow;
use crate::utils::{clamp_unit, round_down_to_lot, safe_div};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("insufficient candle history: have {have}, need {need}")]
    InsufficientHistory { have: usize, need: usize },
}

/// Derived S1 state. Recomputed every cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct S1State {
    pub high: Decimal,
    pub low: Decimal,
    pub range_position: Decimal,
    pub scale: Decimal,
    pub policy: S1Policy,
    pub computed_at: DateTime<Utc>,
}

/// Where `price` sits in `[low, high]`, clamped to [0, 1].
///
/// A degenerate range maps to 0 at or below the low and 1 above it.
pub fn range_position(price: Decimal, high: Decimal, low: Decimal) -> Decimal {
    if price <= low {
        return Decimal::ZERO;
    }
    if price >= high {
        return Decimal::ONE;
    }
    clamp_unit((price - low) / (high - low))
}

pub fn apply_policy(range_position: Decimal, policy: S1Policy) -> Decimal {
    match policy {
        S1Policy::Momentum => range_position,
        S1Policy::MeanReversion => Decimal::ONE - range_position,
    }
}

/// Compute the S1 state from closed candles and the current price.
pub fn compute_signal(
    window: &CandleWindow,
    price: Decimal,
    config: &S1Config,
    now: DateTime<Utc>,
) -> Result<S1State, SignalError> {
    let need = config.lookback;
    let have = window.len();
    if have < need {
        return Err(SignalError::InsufficientHistory { have, need });
    }

    let (high, low) = window
        .high_low(need)
        .ok_or(SignalError::InsufficientHistory { have, need })?;
    let position = range_position(price, high, low);

    Ok(S1State {
        high,
        low,
        range_position: position,
        scale: apply_policy(position, config.policy),
        policy: config.policy,
        computed_at: now,
    })
}

/// Inputs for the breakout rebalance rule.
#[derive(Debug, Clone, Copy)]
pub struct BreakoutInputs {
    pub position: Decimal,
    pub equity: Decimal,
    pub lot_size: Decimal,
    pub min_notional: Decimal,
}

/// Order proposed when price leaves the S1 range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakoutProposal {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub current_ratio: Decimal,
    pub target_ratio: Decimal,
}

/// Propose a move toward the target position ratio on a range breakout.
///
/// Above the high an over-weight position is trimmed to `sell_target_ratio`
/// at the bid; below the low an under-weight one is topped up to
/// `buy_target_ratio` at the ask.
pub fn breakout_adjustment(
    state: &S1State,
    snapshot: &PriceSnapshot,
    inputs: &BreakoutInputs,
    config: &S1Config,
) -> Option<BreakoutProposal> {
    if !config.breakout_rebalance || inputs.equity <= Decimal::ZERO {
        return None;
    }

    let current_ratio = safe_div(inputs.position * snapshot.last, inputs.equity);
    let (side, price, target_ratio) = if snapshot.last > state.high
        && current_ratio > config.sell_target_ratio
    {
        (Side::Sell, snapshot.bid, config.sell_target_ratio)
    } else if snapshot.last < state.low && current_ratio < config.buy_target_ratio {
        (Side::Buy, snapshot.ask, config.buy_target_ratio)
    } else {
        return None;
    };

    // Valued at the execution price the target can land on the other side
    let target_quantity = safe_div(target_ratio * inputs.equity, price);
    let shortfall = match side {
        Side::Sell => inputs.position - target_quantity,
        Side::Buy => target_quantity - inputs.position,
    };
    if shortfall <= Decimal::ZERO {
        return None;
    }
    let quantity = round_down_to_lot(shortfall, inputs.lot_size);
    if quantity * price < inputs.min_notional {
        return None;
    }

    Some(BreakoutProposal {
        side,
        price,
        quantity,
        current_ratio,
        target_ratio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{daily_candles, test_config};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn window(count: usize, high: Decimal, low: Decimal) -> CandleWindow {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut candles = daily_candles(start, count, dec!(600));
        candles[count - 10].high = high;
        candles[count - 2].low = low;
        let mut window = CandleWindow::new(52, Duration::days(1));
        window.replace_all(candles, start + Duration::days(count as i64 + 1));
        window
    }

    #[test]
    fn test_insufficient_history() {
        let config = test_config();
        let result = compute_signal(&window(30, dec!(700), dec!(500)), dec!(600), &config.s1, Utc::now());
        assert_eq!(result, Err(SignalError::InsufficientHistory { have: 30, need: 52 }));
    }

    #[test]
    fn test_extremes_map_exactly() {
        let mut config = test_config().s1;
        config.policy = S1Policy::Momentum;
        let w = window(60, dec!(700), dec!(500));

        let at_low = compute_signal(&w, dec!(500), &config, Utc::now()).unwrap();
        assert_eq!(at_low.scale, Decimal::ZERO);
        let below_low = compute_signal(&w, dec!(450), &config, Utc::now()).unwrap();
        assert_eq!(below_low.scale, Decimal::ZERO);
        let above_high = compute_signal(&w, dec!(750), &config, Utc::now()).unwrap();
        assert_eq!(above_high.scale, Decimal::ONE);

        config.policy = S1Policy::MeanReversion;
        let at_low = compute_signal(&w, dec!(500), &config, Utc::now()).unwrap();
        assert_eq!(at_low.scale, Decimal::ONE);
        let mid = compute_signal(&w, dec!(600), &config, Utc::now()).unwrap();
        assert_eq!(mid.range_position, dec!(0.5));
        assert_eq!(mid.scale, dec!(0.5));
    }

    #[test]
    fn test_degenerate_range() {
        assert_eq!(range_position(dec!(600), dec!(600), dec!(600)), Decimal::ZERO);
        assert_eq!(range_position(dec!(601), dec!(600), dec!(600)), Decimal::ONE);
    }

    #[test]
    fn test_scale_always_in_unit_interval() {
        let w = window(60, dec!(700), dec!(500));
        for policy in [S1Policy::Momentum, S1Policy::MeanReversion] {
            let mut config = test_config().s1;
            config.policy = policy;
            let mut price = dec!(400);
            while price <= dec!(800) {
                let state = compute_signal(&w, price, &config, Utc::now()).unwrap();
                assert!(state.scale >= Decimal::ZERO && state.scale <= Decimal::ONE);
                price += dec!(7.5);
            }
        }
    }

    #[test]
    fn test_breakout_trims_above_high() {
        let mut config = test_config().s1;
        config.breakout_rebalance = true;
        let w = window(60, dec!(700), dec!(500));
        let state = compute_signal(&w, dec!(720), &config, Utc::now()).unwrap();
        let snapshot = PriceSnapshot {
            timestamp: Utc::now(),
            last: dec!(720),
            bid: dec!(719.9),
            ask: dec!(720.1),
        };
        let inputs = BreakoutInputs {
            position: dec!(3),
            equity: dec!(3000),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
        };

        let proposal = breakout_adjustment(&state, &snapshot, &inputs, &config).unwrap();
        assert_eq!(proposal.side, Side::Sell);
        assert_eq!(proposal.price, dec!(719.9));
        // target 0.5 * 3000 / 719.9 = 2.0836.. -> sell 0.916
        assert_eq!(proposal.quantity, dec!(0.916));

        config.breakout_rebalance = false;
        assert!(breakout_adjustment(&state, &snapshot, &inputs, &config).is_none());
    }

    #[test]
    fn test_breakout_skips_sell_when_bid_puts_target_above_position() {
        let mut config = test_config().s1;
        config.breakout_rebalance = true;
        let w = window(60, dec!(700), dec!(500));
        let state = compute_signal(&w, dec!(720), &config, Utc::now()).unwrap();
        let snapshot = PriceSnapshot {
            timestamp: Utc::now(),
            last: dec!(720),
            bid: dec!(700),
            ask: dec!(720.1),
        };
        // 720 / 1430 is just over half, but 0.5 * 1430 / 700 = 1.021 BNB
        let inputs = BreakoutInputs {
            position: dec!(1),
            equity: dec!(1430),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
        };

        assert!(breakout_adjustment(&state, &snapshot, &inputs, &config).is_none());
    }

    #[test]
    fn test_breakout_buys_below_low() {
        let mut config = test_config().s1;
        config.breakout_rebalance = true;
        let w = window(60, dec!(700), dec!(500));
        let state = compute_signal(&w, dec!(480), &config, Utc::now()).unwrap();
        let snapshot = PriceSnapshot::at(dec!(480), Utc::now());
        let inputs = BreakoutInputs {
            position: dec!(1),
            equity: dec!(2400),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
        };

        let proposal = breakout_adjustment(&state, &snapshot, &inputs, &config).unwrap();
        assert_eq!(proposal.side, Side::Buy);
        // 0.7 * 2400 / 480 = 3.5 -> buy 2.5
        assert_eq!(proposal.quantity, dec!(2.5));
    }
}
