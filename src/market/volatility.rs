//! Realised volatility of hourly closes and the grid step it maps to.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::exchange::Candle;

const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

/// Annualised standard deviation of hourly log returns.
///
/// `None` with fewer than three closes or any close that is not positive.
pub fn annualized_volatility(candles: &[Candle]) -> Option<f64> {
    let closes = candles
        .iter()
        .map(|c| c.close.to_f64().filter(|close| *close > 0.0))
        .collect::<Option<Vec<f64>>>()?;
    if closes.len() < 3 {
        return None;
    }

    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() * HOURS_PER_YEAR.sqrt())
}

/// Grid step for an annualised volatility: 1% below 20%, then half a
/// percent more per 20 points, capped at 4% from 120% up.
pub fn step_for_volatility(volatility: f64) -> Decimal {
    let per_mille = match volatility {
        v if v < 0.20 => 10,
        v if v < 0.40 => 15,
        v if v < 0.60 => 20,
        v if v < 0.80 => 25,
        v if v < 1.00 => 30,
        v if v < 1.20 => 35,
        _ => 40,
    };
    Decimal::new(per_mille, 3)
}
