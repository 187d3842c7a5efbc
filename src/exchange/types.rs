//! Type definitions for the gateway interface and Binance spot responses.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::error::GatewayError;

// ==================== Domain Types ====================

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Order can still trade.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::PendingCancel
        )
    }
}

/// Latest top-of-book view. Replaced wholesale on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl PriceSnapshot {
    /// Snapshot with a zero spread, used by tests and the paper exchange.
    pub fn at(last: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            last,
            bid: last,
            ask: last,
        }
    }
}

/// One OHLC candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// Balance of one asset across spot and Simple Earn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
    /// Flexible Simple Earn holdings
    pub earn: Decimal,
}

impl AssetBalance {
    pub fn spot_total(&self) -> Decimal {
        self.free + self.locked
    }

    pub fn total(&self) -> Decimal {
        self.free + self.locked + self.earn
    }
}

/// Account balances keyed by asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBalances {
    pub assets: HashMap<String, AssetBalance>,
}

impl AccountBalances {
    /// Balance for an asset, zero when absent.
    pub fn get(&self, asset: &str) -> AssetBalance {
        self.assets.get(asset).copied().unwrap_or_default()
    }

    /// Quote-denominated equity of a base/quote pair at `price`.
    pub fn equity(&self, base: &str, quote: &str, price: Decimal) -> Decimal {
        self.get(quote).total() + self.get(base).total() * price
    }
}

/// Limit order submitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub time_in_force: TimeInForce,
    pub client_order_id: String,
}

/// Exchange view of one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
}

impl OrderReport {
    pub fn remaining(&self) -> Decimal {
        (self.orig_qty - self.executed_qty).max(Decimal::ZERO)
    }
}

/// Direction of a spot <-> Simple Earn transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Subscribe idle spot funds to flexible earn
    ToYield,
    /// Redeem flexible earn back to spot
    ToSpot,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::ToYield => write!(f, "spot->earn"),
            TransferDirection::ToSpot => write!(f, "earn->spot"),
        }
    }
}

/// Trading filters of a spot symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_quantity: Decimal,
    pub min_notional: Decimal,
}

// ==================== Binance Spot Wire Types ====================

/// Error payload returned by Binance on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTicker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
}

/// Last traded price.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

/// Spot order as returned by order placement, cancellation and queries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotOrder {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    /// Cancel responses carry the original client id here
    #[serde(default)]
    pub orig_client_order_id: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub status: OrderStatus,
    pub side: Side,
}

impl From<SpotOrder> for OrderReport {
    fn from(order: SpotOrder) -> Self {
        Self {
            order_id: order.order_id,
            client_order_id: order.orig_client_order_id.unwrap_or(order.client_order_id),
            side: order.side,
            price: order.price,
            orig_qty: order.orig_qty,
            executed_qty: order.executed_qty,
            status: order.status,
        }
    }
}

/// Spot account information.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotAccount {
    pub balances: Vec<SpotBalance>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// Paged Simple Earn response.
#[derive(Debug, Clone, Deserialize)]
pub struct EarnPage<T> {
    #[serde(default = "Vec::new")]
    pub rows: Vec<T>,
    #[serde(default)]
    pub total: u64,
}

/// Flexible Simple Earn holding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnPosition {
    pub asset: String,
    pub product_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
}

/// Flexible Simple Earn product listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnProduct {
    pub asset: String,
    pub product_id: String,
    pub status: String,
}

/// Spot exchange information.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotExchangeInfo {
    pub symbols: Vec<SpotSymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotSymbolInfo {
    pub symbol: String,
    pub filters: Vec<SymbolFilter>,
}

/// Symbol filters we care about; everything else is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

impl SpotSymbolInfo {
    /// Collapse the filter list into `SymbolFilters`, falling back to `defaults`.
    pub fn filters(&self, defaults: SymbolFilters) -> SymbolFilters {
        let mut out = defaults;
        for filter in &self.filters {
            match filter {
                SymbolFilter::Price { tick_size } => out.tick_size = *tick_size,
                SymbolFilter::LotSize { min_qty, step_size } => {
                    out.lot_size = *step_size;
                    out.min_quantity = *min_qty;
                }
                SymbolFilter::Notional { min_notional }
                | SymbolFilter::MinNotional { min_notional } => out.min_notional = *min_notional,
                SymbolFilter::Other => {}
            }
        }
        out
    }
}

/// Parse one `/api/v3/klines` row.
///
/// Rows are heterogeneous arrays: `[openTime, "open", "high", "low", "close",
/// "volume", closeTime, ...]`.
pub fn parse_kline(row: &[serde_json::Value]) -> Result<Candle, GatewayError> {
    let millis = |idx: usize| -> Result<DateTime<Utc>, GatewayError> {
        row.get(idx)
            .and_then(|v| v.as_i64())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| GatewayError::Decode(format!("kline field {} is not a timestamp", idx)))
    };
    let decimal = |idx: usize| -> Result<Decimal, GatewayError> {
        row.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| GatewayError::Decode(format!("kline field {} is not a decimal", idx)))
    };

    Ok(Candle {
        open_time: millis(0)?,
        open: decimal(1)?,
        high: decimal(2)?,
        low: decimal(3)?,
        close: decimal(4)?,
        close_time: millis(6)?,
    })
}
