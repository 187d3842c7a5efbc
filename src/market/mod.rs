//! Market data: price snapshots, the rolling candle window used by S1 and
//! the hourly volatility that sizes a fresh ladder.

mod candles;
mod gate;
mod volatility;

pub use candles::{interval_from_str, CandleWindow};
pub use gate::MarketDataGate;
pub use volatility::{annualized_volatility, step_for_volatility};
