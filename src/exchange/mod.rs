//! Exchange integrations for the grid engine.
//!
//! ## Gateway
//! Every exchange interaction goes through [`ExchangeGateway`]:
//! - Market data (top of book, candles)
//! - Account state (spot and Simple Earn balances, open orders)
//! - Order placement, cancellation and lookup by client order id
//! - Spot <-> Simple Earn transfers
//!
//! ## Implementations
//! - [`BinanceSpotClient`]: signed REST client for Binance spot
//! - [`PaperExchange`]: in-memory simulation for paper trading and tests
//! - [`BookTickerStream`]: optional push price feed

mod client;
mod error;
pub mod paper;
mod retry;
mod traits;
mod types;
mod websocket;

pub use client::BinanceSpotClient;
pub use error::{GatewayError, GatewayResult};
pub use paper::{PaperExchange, PaperOp};
pub use retry::RetryPolicy;
#[cfg(test)]
pub use traits::MockExchangeGateway;
pub use traits::ExchangeGateway;
pub use types::*;
pub use websocket::{parse_book_ticker, BookTickerStream};
