//! Shared fixtures for unit tests.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::Config;
use crate::exchange::Candle;

/// Default configuration with a 1% step and near-instant retries.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.grid.step_pct = dec!(0.01);
    config.engine.retry_max_attempts = 3;
    config.engine.retry_base_delay_ms = 1;
    config.engine.retry_max_delay_ms = 4;
    config.engine.request_timeout_secs = 1;
    config.engine.db_path = ":memory:".to_string();
    config
}

/// `count` consecutive closed daily candles starting at `start`, each
/// trading within 1% of `price`.
pub fn daily_candles(start: DateTime<Utc>, count: usize, price: Decimal) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let open_time = start + Duration::days(i as i64);
            Candle {
                open_time,
                close_time: open_time + Duration::days(1) - Duration::milliseconds(1),
                open: price,
                high: price * dec!(1.01),
                low: price * dec!(0.99),
                close: price,
            }
        })
        .collect()
}
