//! Market Data Gate: latest price snapshot plus the S1 candle window.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::candles::{interval_from_str, CandleWindow};
use crate::config::{MarketConfig, S1Config};
use crate::exchange::{ExchangeGateway, GatewayResult, PriceSnapshot, RetryPolicy};

/// Refetch interval for a window that is not warm yet.
const COLD_REFRESH_MINUTES: i64 = 60;

pub struct MarketDataGate {
    symbol: String,
    interval: String,
    refresh: Duration,
    stream_stale: Duration,
    window: CandleWindow,
    latest: Option<PriceSnapshot>,
    candles_fetched_at: Option<DateTime<Utc>>,
    stream: Option<watch::Receiver<Option<PriceSnapshot>>>,
}

impl MarketDataGate {
    pub fn new(market: &MarketConfig, s1: &S1Config) -> Self {
        Self {
            symbol: market.symbol.clone(),
            interval: s1.candle_interval.clone(),
            refresh: Duration::minutes(s1.refresh_minutes as i64),
            stream_stale: Duration::seconds(market.stream_stale_secs as i64),
            window: CandleWindow::new(s1.lookback, Self::interval_duration(&s1.candle_interval)),
            latest: None,
            candles_fetched_at: None,
            stream: None,
        }
    }

    fn interval_duration(interval: &str) -> Duration {
        interval_from_str(interval).unwrap_or_else(|| Duration::days(1))
    }

    /// Prefer pushed prices from a stream while they are fresh.
    pub fn with_stream(mut self, stream: watch::Receiver<Option<PriceSnapshot>>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Apply reloaded S1 settings; a new lookback or interval rebuilds the window.
    pub fn apply_config(&mut self, s1: &S1Config) {
        self.refresh = Duration::minutes(s1.refresh_minutes as i64);
        if s1.lookback != self.window.capacity() || s1.candle_interval != self.interval {
            info!(
                lookback = s1.lookback,
                interval = %s1.candle_interval,
                "Candle window settings changed, refetching history"
            );
            self.interval = s1.candle_interval.clone();
            self.window = CandleWindow::new(s1.lookback, Self::interval_duration(&s1.candle_interval));
            self.candles_fetched_at = None;
        }
    }

    pub fn latest(&self) -> Option<&PriceSnapshot> {
        self.latest.as_ref()
    }

    pub fn window(&self) -> &CandleWindow {
        &self.window
    }

    fn candles_due(&self, now: DateTime<Utc>) -> bool {
        match self.candles_fetched_at {
            None => true,
            Some(at) if now - at >= self.refresh => true,
            Some(at) => !self.window.is_warm() && now - at >= Duration::minutes(COLD_REFRESH_MINUTES),
        }
    }

    fn fresh_stream_price(&self, now: DateTime<Utc>) -> Option<PriceSnapshot> {
        let snapshot = self.stream.as_ref()?.borrow().clone()?;
        (now - snapshot.timestamp <= self.stream_stale).then_some(snapshot)
    }

    /// Refresh the price snapshot and, when due, the candle window.
    ///
    /// Fails only when no price could be obtained. A failed candle fetch keeps
    /// the previous window and is retried next cycle.
    pub async fn refresh<G: ExchangeGateway + ?Sized>(
        &mut self,
        gateway: &G,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> GatewayResult<PriceSnapshot> {
        let streamed = self.fresh_stream_price(now);
        let fetch_candles = self.candles_due(now);
        let symbol = self.symbol.as_str();
        let interval = self.interval.as_str();
        // One extra for the forming candle, which the window drops
        let limit = self.window.capacity() + 1;

        let price_fut = async move {
            match streamed {
                Some(snapshot) => Ok(snapshot),
                None => retry.read("get_price", move || gateway.get_price(symbol)).await,
            }
        };
        let candles_fut = async move {
            if fetch_candles {
                Some(
                    retry
                        .read("get_candles", move || gateway.get_candles(symbol, interval, limit))
                        .await,
                )
            } else {
                None
            }
        };
        let (price, candles) = tokio::join!(price_fut, candles_fut);

        match candles {
            Some(Ok(candles)) => {
                self.window.replace_all(candles, now);
                self.candles_fetched_at = Some(now);
                debug!(len = self.window.len(), warm = self.window.is_warm(), "Candles refreshed");
            }
            Some(Err(e)) => warn!(error = %e, "Candle refresh failed, keeping previous window"),
            None => {}
        }

        let price = price?;
        self.latest = Some(price.clone());
        Ok(price)
    }
}
