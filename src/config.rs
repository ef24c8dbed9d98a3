//! Configuration types for poly-scalper

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    /// Strategy parameters; omitted keys fall back to the defaults
    #[serde(default)]
    pub strategy: StrategyParams,
    pub feed: FeedConfig,
    pub venue: VenueConfig,
    pub telemetry: TelemetryConfig,
}

/// Engine loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Gate for real order placement; false = dry-run
    pub trading_enabled: bool,
    /// Upper bound on concurrently tracked markets
    pub max_concurrent_markets: usize,
    /// Realized loss at which new entries are refused
    pub daily_loss_limit: Decimal,
    /// Evaluation tick interval in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    /// Seconds past end_time before a flat market is retired
    #[serde(default = "default_grace_secs")]
    pub market_grace_secs: i64,
}

fn default_tick_ms() -> u64 {
    200
}

fn default_grace_secs() -> i64 {
    600
}

/// Strategy parameters for the multi-level DCA scalper
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyParams {
    /// Ask at or below this triggers the initial LEVEL entry
    pub entry_trigger: Decimal,
    /// Drop from first entry required for DCA-1
    pub dca_drop_1: Decimal,
    /// Cumulative drop from first entry required for DCA-2
    pub dca_drop_2: Decimal,
    /// Shares per entry
    pub clip_size: Decimal,
    /// Opposite ask below this unwinds the held LEVEL ladder
    pub unwind_trigger: Decimal,
    /// Resting take-profit limit price for LEVEL exits
    pub tp_price: Decimal,
    /// Ask at or below this (but above entry_trigger) allows a late high-scalp entry
    pub high_scalp_entry: Decimal,
    /// Profit fraction at which a high-scalp position exits at market
    pub high_scalp_profit_target: Decimal,
    /// Full LEVEL round-trips allowed per market
    pub max_completed_cycles: u32,
    /// Opportunistic high-scalp entries allowed per market
    pub max_high_scalps: u32,
    /// No new LEVEL entry with less than this many seconds left
    pub min_entry_time_left: i64,
    /// LEVEL positions are force-closed at this deadline
    pub force_unwind_time_left: i64,
    /// Any remaining position is force-closed at this deadline
    pub force_exit_time_left: i64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            entry_trigger: dec!(0.34),
            dca_drop_1: dec!(0.24),
            dca_drop_2: dec!(0.38),
            clip_size: dec!(10),
            unwind_trigger: dec!(0.60),
            tp_price: dec!(0.88),
            high_scalp_entry: dec!(0.90),
            high_scalp_profit_target: dec!(0.02),
            max_completed_cycles: 3,
            max_high_scalps: 4,
            min_entry_time_left: 420,
            force_unwind_time_left: 300,
            force_exit_time_left: 180,
        }
    }
}

/// Spot price feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Spot symbol, e.g. "BTCUSDT"
    pub symbol: String,
    /// Seconds before a feed's last quote is considered stale
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    /// Seconds of price history to retain
    #[serde(default = "default_history_secs")]
    pub history_secs: i64,
}

fn default_staleness_secs() -> i64 {
    5
}

fn default_history_secs() -> i64 {
    600
}

/// Venue endpoints and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// REST base URL for order placement
    pub rest_url: String,
    /// WebSocket URL for the market-data stream
    pub ws_url: String,
    /// Opaque API credential passed through to the venue
    #[serde(default)]
    pub api_key: String,
    /// Timeout for order placement and cancellation calls
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

fn default_order_timeout_secs() -> u64 {
    5
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints eagerly, before any component starts
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.strategy;
        anyhow::ensure!(
            s.entry_trigger > Decimal::ZERO && s.entry_trigger < Decimal::ONE,
            "entry_trigger must be in (0, 1)"
        );
        anyhow::ensure!(
            s.high_scalp_entry > s.entry_trigger,
            "high_scalp_entry must exceed entry_trigger"
        );
        anyhow::ensure!(
            s.tp_price > Decimal::ZERO && s.tp_price < Decimal::ONE,
            "tp_price must be in (0, 1)"
        );
        anyhow::ensure!(s.clip_size > Decimal::ZERO, "clip_size must be positive");
        anyhow::ensure!(
            s.min_entry_time_left > s.force_unwind_time_left,
            "min_entry_time_left must exceed force_unwind_time_left"
        );
        anyhow::ensure!(
            s.force_unwind_time_left > s.force_exit_time_left,
            "force_unwind_time_left must exceed force_exit_time_left"
        );
        anyhow::ensure!(
            self.engine.max_concurrent_markets > 0,
            "max_concurrent_markets must be positive"
        );
        anyhow::ensure!(
            self.engine.daily_loss_limit >= Decimal::ZERO,
            "daily_loss_limit must be non-negative"
        );
        Ok(())
    }
}
