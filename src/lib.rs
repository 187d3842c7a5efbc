//! # BNB Grid Bot
//!
//! Strategy and risk engine for a BNB/USDT spot grid on Binance, with idle
//! funds parked in Simple Earn.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Gateway trait, Binance spot client, websocket feed and paper exchange
//! - `market`: Market data gate (price snapshot and candle window)
//! - `risk`: Risk limiter and operational health alerts
//! - `strategy`: S1 signal, grid ladder, fund allocator and the cycle engine
//! - `persistence`: SQLite state for restart recovery
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod exchange;
pub mod market;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::Config;
