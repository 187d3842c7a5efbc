//! Fixed-capacity sliding window of closed candles.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::exchange::Candle;

/// Closed candles sorted by open time, contiguous, at most `capacity` long.
#[derive(Debug, Clone)]
pub struct CandleWindow {
    capacity: usize,
    interval: Duration,
    candles: VecDeque<Candle>,
}

/// Parse a Binance kline interval ("15m", "4h", "1d", "1w").
pub fn interval_from_str(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (count, unit) = value.split_at(value.len() - 1);
    let count: i64 = count.parse().ok().filter(|c| *c > 0)?;
    match unit {
        "m" => Some(Duration::minutes(count)),
        "h" => Some(Duration::hours(count)),
        "d" => Some(Duration::days(count)),
        "w" => Some(Duration::weeks(count)),
        _ => None,
    }
}

impl CandleWindow {
    pub fn new(capacity: usize, interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            interval,
            candles: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Window holds a full `capacity` of candles.
    pub fn is_warm(&self) -> bool {
        self.candles.len() >= self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Rebuild the window from a fresh fetch.
    ///
    /// Forming candles are dropped, the rest sorted and de-duplicated, and only
    /// the contiguous suffix is kept.
    pub fn replace_all(&mut self, mut candles: Vec<Candle>, now: DateTime<Utc>) {
        candles.retain(|c| c.close_time < now);
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        let mut start = 0;
        for i in 1..candles.len() {
            if candles[i].open_time != candles[i - 1].open_time + self.interval {
                start = i;
            }
        }
        if start > 0 {
            warn!(dropped = start, "Candle history has a gap, keeping contiguous suffix");
        }

        let skip = (candles.len() - start).saturating_sub(self.capacity);
        self.candles = candles.into_iter().skip(start + skip).collect();
        debug!(len = self.candles.len(), capacity = self.capacity, "Candle window replaced");
    }

    /// Highest high and lowest low over the most recent `n` candles.
    pub fn high_low(&self, n: usize) -> Option<(Decimal, Decimal)> {
        let skip = self.candles.len().saturating_sub(n);
        self.candles.iter().skip(skip).fold(None, |acc, c| match acc {
            None => Some((c.high, c.low)),
            Some((high, low)) => Some((high.max(c.high), low.min(c.low))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::daily_candles;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(interval_from_str("1d"), Some(Duration::days(1)));
        assert_eq!(interval_from_str("15m"), Some(Duration::minutes(15)));
        assert_eq!(interval_from_str("1M"), None);
        assert_eq!(interval_from_str("d"), None);
    }

    #[test]
    fn test_replace_drops_forming_candle_and_caps() {
        let candles = daily_candles(start(), 60, dec!(600));
        let now = candles[59].open_time + Duration::hours(3);
        let mut window = CandleWindow::new(52, Duration::days(1));

        window.replace_all(candles.clone(), now);

        assert_eq!(window.len(), 52);
        assert!(window.is_warm());
        assert_eq!(window.last().unwrap().open_time, candles[58].open_time);
    }

    #[test]
    fn test_replace_keeps_suffix_after_gap() {
        let mut candles = daily_candles(start(), 40, dec!(600));
        candles.remove(10);
        candles.reverse();
        let now = start() + Duration::days(41);
        let mut window = CandleWindow::new(52, Duration::days(1));

        window.replace_all(candles, now);

        assert_eq!(window.len(), 29);
        let times: Vec<_> = window.iter().map(|c| c.open_time).collect();
        assert!(times.windows(2).all(|w| w[1] - w[0] == Duration::days(1)));
    }

    #[test]
    fn test_high_low_over_recent_candles() {
        let mut candles = daily_candles(start(), 10, dec!(600));
        candles[1].high = dec!(700);
        candles[8].low = dec!(500);
        let mut window = CandleWindow::new(10, Duration::days(1));
        window.replace_all(candles, start() + Duration::days(20));

        assert_eq!(window.high_low(10), Some((dec!(700), dec!(500))));
        let (high, low) = window.high_low(5).unwrap();
        assert!(high < dec!(700));
        assert_eq!(low, dec!(500));
    }
}
