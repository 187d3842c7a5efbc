//! Configuration management for the grid bot.
//!
//! Loads settings from an optional `config` file and `GRID__*` environment
//! variables. Validation failures are the only errors allowed to stop the
//! process, and they happen at startup.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Traded pair and exchange filters
    #[serde(default)]
    pub market: MarketConfig,
    /// Grid ladder geometry and reconciliation behaviour
    #[serde(default)]
    pub grid: GridConfig,
    /// S1 trend filter
    #[serde(default)]
    pub s1: S1Config,
    /// Risk limits applied before every order
    #[serde(default)]
    pub risk: RiskConfig,
    /// Spot <-> Simple Earn rebalancing
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Decision loop timing, retries and persistence
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Exchange symbol (e.g. "BNBUSDT")
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Price tick size (PRICE_FILTER)
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
    /// Quantity step (LOT_SIZE)
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    /// Smallest accepted order quantity
    #[serde(default = "default_min_quantity")]
    pub min_quantity: Decimal,
    /// Smallest accepted order notional in quote
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Feed the market data gate from the bookTicker websocket
    #[serde(default)]
    pub use_stream: bool,
    /// Stream snapshots older than this fall back to REST
    #[serde(default = "default_stream_stale_secs")]
    pub stream_stale_secs: u64,
}

/// What to do with exchange orders the ladder does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Cancel them (safest)
    Cancel,
    /// Leave them in place and raise an alert for manual handling
    Flag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Spacing between adjacent slots as a fraction of the anchor (0.01 = 1%)
    #[serde(default = "default_step_pct")]
    pub step_pct: Decimal,
    /// Number of buy levels below and sell levels above the center
    #[serde(default = "default_levels")]
    pub levels: u32,
    /// Quote notional per grid order, and the floor when sizing from equity
    #[serde(default = "default_order_notional")]
    pub order_notional: Decimal,
    /// Size each order as this fraction of total equity instead
    #[serde(default)]
    pub order_notional_ratio: Option<Decimal>,
    /// Pick the step of a fresh ladder from hourly volatility
    #[serde(default)]
    pub volatility_step: bool,
    /// Hourly candles used for the volatility estimate
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    /// Fixed anchor price; the first observed price is used when unset
    #[serde(default)]
    pub anchor_price: Option<Decimal>,
    /// Extra slots beyond the depth an existing order may drift before it is cancelled
    #[serde(default = "default_cancel_tolerance")]
    pub cancel_tolerance: u32,
    /// Adopt unknown exchange orders that sit on a slot
    #[serde(default)]
    pub adopt_orphans: bool,
    /// Handling of orders that cannot be adopted
    #[serde(default = "default_orphan_policy")]
    pub orphan_policy: OrphanPolicy,
    /// Cycles a slot waits after the exchange rejected its order
    #[serde(default = "default_rejection_cooldown")]
    pub rejection_cooldown_cycles: u64,
    /// Prefix of client order ids owned by this bot
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Base quantity difference tolerated between Position and exchange balances
    #[serde(default = "default_position_drift_tolerance")]
    pub position_drift_tolerance: Decimal,
}

/// Mapping from S1 range position to exposure scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S1Policy {
    /// More exposure near the 52-day high
    Momentum,
    /// More exposure near the 52-day low
    MeanReversion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S1Config {
    /// Number of closed daily candles in the high/low window
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Kline interval used for the window
    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,
    /// Minutes between candle refreshes (23.9h by default)
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: u64,
    #[serde(default = "default_s1_policy")]
    pub policy: S1Policy,
    /// Scale used while history is insufficient (0 = no new buys)
    #[serde(default)]
    pub fallback_scale: Decimal,
    /// Trade toward target ratios when price breaks the 52-day range
    #[serde(default)]
    pub breakout_rebalance: bool,
    /// Position ratio to sell down to above the 52-day high
    #[serde(default = "default_sell_target_ratio")]
    pub sell_target_ratio: Decimal,
    /// Position ratio to buy up to below the 52-day low
    #[serde(default = "default_buy_target_ratio")]
    pub buy_target_ratio: Decimal,
    /// Cycles to wait before re-sending a breakout order that did not fill
    #[serde(default = "default_breakout_cooldown")]
    pub breakout_cooldown_cycles: u64,
}

/// How the risk limiter treats an order larger than its headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Reject anything that does not fit
    Reject,
    /// Shrink to the headroom when the remainder is still a useful order
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Max base value / total equity (0.0-1.0)
    #[serde(default = "default_max_position_ratio")]
    pub max_position_ratio: Decimal,
    /// Min base value / total equity protected from grid sells (0.0-1.0)
    #[serde(default = "default_min_position_ratio")]
    pub min_position_ratio: Decimal,
    /// Absolute base position ceiling before S1 scaling
    #[serde(default = "default_max_absolute_position")]
    pub max_absolute_position: Decimal,
    /// Largest single order in base units
    #[serde(default = "default_max_order_size")]
    pub max_order_size: Decimal,
    /// Free quote that buys must leave on spot
    #[serde(default = "default_min_cash_buffer")]
    pub min_cash_buffer: Decimal,
    #[serde(default = "default_clamp_policy")]
    pub clamp_policy: ClampPolicy,
    /// Smallest clamped quantity still worth placing
    #[serde(default = "default_clamp_min_quantity")]
    pub clamp_min_quantity: Decimal,
    /// Errors within the window before an API error spike alert
    #[serde(default = "default_max_errors_per_window")]
    pub max_errors_per_window: u32,
    /// Error window size in minutes
    #[serde(default = "default_error_window_minutes")]
    pub error_window_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run the allocator every N cycles
    #[serde(default = "default_every_n_cycles")]
    pub every_n_cycles: u64,
    /// Idle quote kept on spot on top of reserved notional
    #[serde(default = "default_quote_buffer")]
    pub quote_buffer: Decimal,
    /// Quote excess above the buffer that triggers a subscription
    #[serde(default = "default_quote_excess_threshold")]
    pub quote_excess_threshold: Decimal,
    /// Smallest quote transfer (USDT)
    #[serde(default = "default_min_transfer_quote")]
    pub min_transfer_quote: Decimal,
    /// Also park idle base asset in Simple Earn
    #[serde(default = "default_true")]
    pub manage_base: bool,
    /// Idle base kept on spot on top of reserved sell quantity
    #[serde(default = "default_base_buffer")]
    pub base_buffer: Decimal,
    #[serde(default = "default_base_excess_threshold")]
    pub base_excess_threshold: Decimal,
    /// Smallest base transfer (BNB)
    #[serde(default = "default_min_transfer_base")]
    pub min_transfer_base: Decimal,
    /// Extra fraction redeemed on top of a shortfall
    #[serde(default = "default_redeem_padding")]
    pub redeem_padding: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between decision cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Timeout applied to every gateway call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per gateway call (first try included)
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Cancel all grid orders on graceful shutdown
    #[serde(default)]
    pub cancel_on_shutdown: bool,
    /// SQLite state file
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Recent actions kept for the dashboard snapshot
    #[serde(default = "default_recent_actions")]
    pub recent_actions: usize,
}

// Default value functions
fn default_symbol() -> String {
    "BNBUSDT".to_string()
}

fn default_base_asset() -> String {
    "BNB".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_lot_size() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_min_quantity() -> Decimal {
    Decimal::new(1, 3) // 0.001 BNB
}

fn default_min_notional() -> Decimal {
    Decimal::new(10, 0) // 10 USDT
}

fn default_stream_stale_secs() -> u64 {
    10
}

fn default_step_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02 = 2%
}

fn default_levels() -> u32 {
    5
}

fn default_order_notional() -> Decimal {
    Decimal::new(20, 0) // 20 USDT per level
}

fn default_volatility_window() -> usize {
    24
}

fn default_cancel_tolerance() -> u32 {
    1
}

fn default_orphan_policy() -> OrphanPolicy {
    OrphanPolicy::Cancel
}

fn default_rejection_cooldown() -> u64 {
    3
}

fn default_client_id_prefix() -> String {
    "bgb".to_string()
}

fn default_position_drift_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01 BNB
}

fn default_lookback() -> usize {
    52
}

fn default_candle_interval() -> String {
    "1d".to_string()
}

fn default_refresh_minutes() -> u64 {
    1434 // 23.9h
}

fn default_s1_policy() -> S1Policy {
    S1Policy::MeanReversion
}

fn default_sell_target_ratio() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_buy_target_ratio() -> Decimal {
    Decimal::new(70, 2) // 0.70
}

fn default_breakout_cooldown() -> u64 {
    10
}

fn default_max_position_ratio() -> Decimal {
    Decimal::new(90, 2) // 0.90
}

fn default_min_position_ratio() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_max_absolute_position() -> Decimal {
    Decimal::new(20, 0) // 20 BNB
}

fn default_max_order_size() -> Decimal {
    Decimal::new(1, 0) // 1 BNB
}

fn default_min_cash_buffer() -> Decimal {
    Decimal::new(10, 0) // 10 USDT
}

fn default_clamp_policy() -> ClampPolicy {
    ClampPolicy::Partial
}

fn default_clamp_min_quantity() -> Decimal {
    Decimal::new(1, 2) // 0.01 BNB
}

fn default_max_errors_per_window() -> u32 {
    10
}

fn default_error_window_minutes() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_every_n_cycles() -> u64 {
    1
}

fn default_quote_buffer() -> Decimal {
    Decimal::new(50, 0) // 50 USDT
}

fn default_quote_excess_threshold() -> Decimal {
    Decimal::new(10, 0) // 10 USDT
}

fn default_min_transfer_quote() -> Decimal {
    Decimal::new(1, 0) // 1 USDT
}

fn default_base_buffer() -> Decimal {
    Decimal::new(5, 2) // 0.05 BNB
}

fn default_base_excess_threshold() -> Decimal {
    Decimal::new(2, 2) // 0.02 BNB
}

fn default_min_transfer_base() -> Decimal {
    Decimal::new(1, 2) // 0.01 BNB
}

fn default_redeem_padding() -> Decimal {
    Decimal::new(5, 2) // 5% on top of the shortfall
}

fn default_poll_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    5_000
}

fn default_db_path() -> String {
    "data/grid_state.db".to_string()
}

fn default_recent_actions() -> usize {
    100
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("GRID"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if config.binance.api_key.is_empty() {
            config.binance.api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
        }
        if config.binance.secret_key.is_empty() {
            config.binance.secret_key = std::env::var("BINANCE_SECRET_KEY").unwrap_or_default();
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let one = Decimal::ONE;
        let zero = Decimal::ZERO;

        anyhow::ensure!(!self.market.symbol.is_empty(), "market.symbol must be set");
        anyhow::ensure!(
            self.market.tick_size > zero && self.market.lot_size > zero,
            "tick_size and lot_size must be positive"
        );

        anyhow::ensure!(
            self.grid.step_pct > zero && self.grid.step_pct < Decimal::new(5, 1),
            "grid.step_pct must be between 0 and 0.5"
        );
        anyhow::ensure!(
            self.grid.levels >= 1 && self.grid.levels <= 50,
            "grid.levels must be between 1 and 50"
        );
        anyhow::ensure!(
            self.grid.order_notional >= self.market.min_notional,
            "grid.order_notional must be at least market.min_notional"
        );
        if let Some(ratio) = self.grid.order_notional_ratio {
            anyhow::ensure!(
                ratio > zero && ratio <= Decimal::new(5, 1),
                "grid.order_notional_ratio must be above 0 and at most 0.5"
            );
        }
        anyhow::ensure!(
            self.grid.volatility_window >= 3 && self.grid.volatility_window <= 1000,
            "grid.volatility_window must be between 3 and 1000"
        );
        if let Some(anchor) = self.grid.anchor_price {
            anyhow::ensure!(anchor > zero, "grid.anchor_price must be positive");
        }
        anyhow::ensure!(
            !self.grid.client_id_prefix.is_empty()
                && self.grid.client_id_prefix.len() <= 10
                && !self.grid.client_id_prefix.contains('-'),
            "grid.client_id_prefix must be 1-10 characters without '-'"
        );

        anyhow::ensure!(self.s1.lookback >= 2, "s1.lookback must be at least 2");
        anyhow::ensure!(
            crate::market::interval_from_str(&self.s1.candle_interval).is_some(),
            "s1.candle_interval must look like 15m, 4h, 1d or 1w"
        );
        anyhow::ensure!(
            self.s1.fallback_scale >= zero && self.s1.fallback_scale <= one,
            "s1.fallback_scale must be between 0 and 1"
        );
        anyhow::ensure!(
            self.s1.sell_target_ratio >= zero
                && self.s1.sell_target_ratio <= self.s1.buy_target_ratio
                && self.s1.buy_target_ratio <= one,
            "s1 targets must satisfy 0 <= sell_target_ratio <= buy_target_ratio <= 1"
        );

        anyhow::ensure!(
            self.risk.max_position_ratio > zero && self.risk.max_position_ratio <= one,
            "risk.max_position_ratio must be between 0 and 1"
        );
        anyhow::ensure!(
            self.risk.min_position_ratio >= zero
                && self.risk.min_position_ratio < self.risk.max_position_ratio,
            "risk.min_position_ratio must be >= 0 and below max_position_ratio"
        );
        anyhow::ensure!(
            self.risk.max_absolute_position > zero && self.risk.max_order_size > zero,
            "risk position and order caps must be positive"
        );
        anyhow::ensure!(
            self.risk.min_cash_buffer >= zero,
            "risk.min_cash_buffer must not be negative"
        );

        anyhow::ensure!(
            self.allocator.every_n_cycles >= 1,
            "allocator.every_n_cycles must be at least 1"
        );
        anyhow::ensure!(
            self.allocator.redeem_padding >= zero && self.allocator.redeem_padding <= one,
            "allocator.redeem_padding must be between 0 and 1"
        );
        anyhow::ensure!(
            self.allocator.min_transfer_quote <= self.allocator.quote_excess_threshold
                && self.allocator.min_transfer_base <= self.allocator.base_excess_threshold,
            "allocator minimum transfers must not exceed their excess thresholds"
        );

        anyhow::ensure!(
            self.engine.poll_interval_secs >= 1,
            "engine.poll_interval_secs must be at least 1"
        );
        anyhow::ensure!(
            self.engine.request_timeout_secs >= 1 && self.engine.retry_max_attempts >= 1,
            "engine timeouts and retry attempts must be at least 1"
        );
        anyhow::ensure!(
            self.engine.retry_base_delay_ms <= self.engine.retry_max_delay_ms,
            "engine.retry_base_delay_ms must not exceed retry_max_delay_ms"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig::default(),
            market: MarketConfig::default(),
            grid: GridConfig::default(),
            s1: S1Config::default(),
            risk: RiskConfig::default(),
            allocator: AllocatorConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            tick_size: default_tick_size(),
            lot_size: default_lot_size(),
            min_quantity: default_min_quantity(),
            min_notional: default_min_notional(),
            use_stream: false,
            stream_stale_secs: default_stream_stale_secs(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            step_pct: default_step_pct(),
            levels: default_levels(),
            order_notional: default_order_notional(),
            order_notional_ratio: None,
            volatility_step: false,
            volatility_window: default_volatility_window(),
            anchor_price: None,
            cancel_tolerance: default_cancel_tolerance(),
            adopt_orphans: false,
            orphan_policy: default_orphan_policy(),
            rejection_cooldown_cycles: default_rejection_cooldown(),
            client_id_prefix: default_client_id_prefix(),
            position_drift_tolerance: default_position_drift_tolerance(),
        }
    }
}

impl Default for S1Config {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            candle_interval: default_candle_interval(),
            refresh_minutes: default_refresh_minutes(),
            policy: default_s1_policy(),
            fallback_scale: Decimal::ZERO,
            breakout_rebalance: false,
            sell_target_ratio: default_sell_target_ratio(),
            buy_target_ratio: default_buy_target_ratio(),
            breakout_cooldown_cycles: default_breakout_cooldown(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_ratio: default_max_position_ratio(),
            min_position_ratio: default_min_position_ratio(),
            max_absolute_position: default_max_absolute_position(),
            max_order_size: default_max_order_size(),
            min_cash_buffer: default_min_cash_buffer(),
            clamp_policy: default_clamp_policy(),
            clamp_min_quantity: default_clamp_min_quantity(),
            max_errors_per_window: default_max_errors_per_window(),
            error_window_minutes: default_error_window_minutes(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_cycles: default_every_n_cycles(),
            quote_buffer: default_quote_buffer(),
            quote_excess_threshold: default_quote_excess_threshold(),
            min_transfer_quote: default_min_transfer_quote(),
            manage_base: true,
            base_buffer: default_base_buffer(),
            base_excess_threshold: default_base_excess_threshold(),
            min_transfer_base: default_min_transfer_base(),
            redeem_padding: default_redeem_padding(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            cancel_on_shutdown: false,
            db_path: default_db_path(),
            recent_actions: default_recent_actions(),
        }
    }
}
