//! Binance spot bookTicker stream feeding the market data gate.

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::PriceSnapshot;

const SPOT_WS_URL: &str = "wss://stream.binance.com:9443";
const SPOT_TESTNET_WS_URL: &str = "wss://testnet.binance.vision";
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "a")]
    pub ask_price: String,
}

/// Parse one bookTicker message into a snapshot. Last price is the mid.
pub fn parse_book_ticker(text: &str) -> Option<PriceSnapshot> {
    let update: BookTickerUpdate = serde_json::from_str(text).ok()?;
    let bid = Decimal::from_str(&update.bid_price).ok()?;
    let ask = Decimal::from_str(&update.ask_price).ok()?;
    if bid <= Decimal::ZERO || ask < bid {
        return None;
    }
    Some(PriceSnapshot {
        timestamp: Utc::now(),
        last: (bid + ask) / Decimal::TWO,
        bid,
        ask,
    })
}

/// Reconnecting bookTicker subscription for one symbol.
pub struct BookTickerStream {
    url: String,
}

impl BookTickerStream {
    pub fn new(symbol: &str, testnet: bool) -> Self {
        let base_url = if testnet {
            SPOT_TESTNET_WS_URL
        } else {
            SPOT_WS_URL
        };
        Self {
            url: format!("{}/ws/{}@bookTicker", base_url, symbol.to_lowercase()),
        }
    }

    /// Spawn the stream task. The receiver holds `None` until the first update.
    pub fn spawn(self) -> watch::Receiver<Option<PriceSnapshot>> {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let mut delay = Duration::from_secs(1);
            loop {
                match self.run_once(&tx).await {
                    Ok(()) => {
                        info!("bookTicker stream closed, reconnecting");
                        delay = Duration::from_secs(1);
                    }
                    Err(e) => {
                        error!(error = %e, "bookTicker stream failed");
                    }
                }
                if tx.is_closed() {
                    debug!("bookTicker receiver dropped, stopping stream");
                    return;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        });
        rx
    }

    async fn run_once(&self, tx: &watch::Sender<Option<PriceSnapshot>>) -> Result<()> {
        info!("Connecting to WebSocket: {}", self.url);
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .context("Failed to connect to WebSocket")?;
        let (_write, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            match msg.context("WebSocket read failed")? {
                Message::Text(text) => match parse_book_ticker(&text) {
                    Some(snapshot) => {
                        if tx.send(Some(snapshot)).is_err() {
                            return Ok(());
                        }
                    }
                    None => warn!("Unparseable bookTicker message"),
                },
                Message::Ping(_) => {
                    // Pong is handled automatically by tungstenite
                    debug!("Received ping");
                }
                Message::Close(_) => {
                    info!("WebSocket closed by server");
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_book_ticker_uses_mid_price() {
        let text = r#"{"u":400900217,"s":"BNBUSDT","b":"599.90","B":"31.2","a":"600.10","A":"40.6"}"#;
        let snapshot = parse_book_ticker(text).unwrap();
        assert_eq!(snapshot.bid, dec!(599.90));
        assert_eq!(snapshot.ask, dec!(600.10));
        assert_eq!(snapshot.last, dec!(600.00));
    }

    #[test]
    fn test_crossed_book_is_ignored() {
        let text = r#"{"u":1,"s":"BNBUSDT","b":"601.00","B":"1","a":"600.00","A":"1"}"#;
        assert!(parse_book_ticker(text).is_none());
        assert!(parse_book_ticker("not json").is_none());
    }

    #[test]
    fn test_stream_url_is_lowercase() {
        let stream = BookTickerStream::new("BNBUSDT", false);
        assert_eq!(stream.url, "wss://stream.binance.com:9443/ws/bnbusdt@bookTicker");
    }
}
