//! Configuration management for the bracket trader.
//!
//! Loads settings from an optional `config.toml` and `BT__`-prefixed
//! environment variables, then validates them once at startup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::market_data::features;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Symbol universe
    #[serde(default)]
    pub universe: UniverseConfig,
    /// Market-data provider plumbing (feed location, retry, cooldowns)
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Price band and liquidity/volatility gates
    #[serde(default)]
    pub gate: GateConfig,
    /// Relaxed-gating triggers
    #[serde(default)]
    pub fast_lane: FastLaneConfig,
    /// Alternative-data minimum-signal gate
    #[serde(default)]
    pub alt_data: AltDataConfig,
    /// Ranking weights and caps
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Daily and portfolio risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Bracket and protection parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Window during which orders and protection may act
    #[serde(default)]
    pub safeguards: SafeguardsConfig,
    /// Feature cache TTLs
    #[serde(default)]
    pub cache: CacheConfig,
    /// Tick cadence and timeouts
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// SQLite state location
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Process-wide trading halt
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Route orders to the real broker instead of the paper broker
    #[serde(default)]
    pub live: bool,
    /// API key id
    #[serde(default)]
    pub api_key: String,
    /// API secret
    #[serde(default)]
    pub secret_key: String,
    /// REST base url
    #[serde(default = "default_broker_base_url")]
    pub base_url: String,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Starting equity for the paper broker
    #[serde(default = "default_paper_equity")]
    pub paper_initial_equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Inline symbol list
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Optional file with one symbol per line (`#` comments allowed)
    #[serde(default)]
    pub file: Option<String>,
    /// Share of symbols whose data cannot be resolved before the scan aborts (0.0-1.0)
    #[serde(default = "default_max_mapping_failure_rate")]
    pub max_mapping_failure_rate: Decimal,
    /// Minimum scanned symbols before the failure rate is enforced
    #[serde(default = "default_min_symbols_for_abort")]
    pub min_symbols_for_abort: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Directory of per-symbol JSON feature documents
    #[serde(default = "default_feed_dir")]
    pub feed_dir: String,
    /// Attempts per provider call (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Upper bound on a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Seconds an endpoint stays suppressed after a rate-limit response
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

/// Liquidity/volatility thresholds for one gating mode.
///
/// Unset fields fall back to the strict floors; [`Config::load`] seeds the
/// relaxed section with its own defaults before any source is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiquidityThresholds {
    /// Market-cap floor in USD (0 = disabled)
    pub min_market_cap: Decimal,
    /// Average daily share volume floor (0 = disabled)
    pub min_avg_volume: Decimal,
    /// Volatility measure as a percent of price must not exceed this (0 = disabled)
    pub max_volatility_pct: Decimal,
    /// Require the snapshot trend flag to be positive
    pub require_positive_trend: bool,
}

/// How a missing market-cap value is treated by the liquidity gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingMarketCapPolicy {
    /// Treat as zero, failing any positive market-cap floor
    Zero,
    /// Skip the market-cap check for this symbol
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Price floor in USD
    #[serde(default = "default_min_price")]
    pub min_price: Decimal,
    /// Price ceiling in USD (0 = no ceiling)
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
    /// Standard thresholds
    #[serde(default = "default_strict_thresholds")]
    pub strict: LiquidityThresholds,
    /// Thresholds applied to fast-lane symbols
    #[serde(default = "default_relaxed_thresholds")]
    pub relaxed: LiquidityThresholds,
    /// Missing market-cap handling
    #[serde(default = "default_missing_market_cap")]
    pub missing_market_cap: MissingMarketCapPolicy,
    /// Snapshots older than this are rejected as stale (0 = disabled)
    #[serde(default)]
    pub max_snapshot_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLaneConfig {
    /// Master switch for relaxed gating
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Only features at most this many days old can trigger the fast lane
    #[serde(default = "default_fast_lane_lookback")]
    pub lookback_days: u32,
    /// Insider-buy count trigger (0 = disabled)
    #[serde(default = "default_fast_lane_insider_buys")]
    pub insider_buy_min: Decimal,
    /// Government contract amount trigger in USD (0 = disabled)
    #[serde(default = "default_fast_lane_contract_amount")]
    pub contract_amount_min: Decimal,
    /// Momentum metric trigger (0 = disabled)
    #[serde(default = "default_fast_lane_momentum")]
    pub momentum_min: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AltDataConfig {
    /// Whether the alternative-data source is in use at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Features older than this do not count as active
    #[serde(default = "default_alt_max_age_days")]
    pub max_age_days: u32,
    /// Minimum insider buys (0 = check disabled)
    #[serde(default = "default_min_insider_buys")]
    pub min_insider_buys: Decimal,
    /// Minimum government contract amount (0 = check disabled)
    #[serde(default)]
    pub min_contract_amount: Decimal,
    /// Minimum congressional purchases (0 = check disabled)
    #[serde(default = "default_min_house_purchases")]
    pub min_house_purchases: Decimal,
    /// Minimum recent social mentions (0 = check disabled)
    #[serde(default)]
    pub min_social_mentions: Decimal,
    /// Distinct categories with a positive value required to pass
    #[serde(default = "default_min_active_categories")]
    pub min_active_categories: usize,
    /// Feature names counted as alternative-data categories
    #[serde(default = "default_alt_categories")]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Per-feature weight (features without a weight do not contribute)
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, Decimal>,
    /// Per-feature cap applied before weighting (absent = uncapped)
    #[serde(default = "default_caps")]
    pub caps: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Hard daily spend cap in USD (0 = disabled)
    #[serde(default = "default_daily_max_spend")]
    pub daily_max_spend_usd: Decimal,
    /// Daily spend cap as a share of buying power (0 = disabled)
    #[serde(default)]
    pub daily_max_spend_pct_buying_power: Decimal,
    /// New positions per trading day (0 = unlimited)
    #[serde(default = "default_daily_max_new_positions")]
    pub daily_max_new_positions: u32,
    /// Concurrent open positions (0 = unlimited)
    #[serde(default = "default_max_total_open_positions")]
    pub max_total_open_positions: u32,
    /// Total open notional / equity cap (0 = disabled)
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: Decimal,
    /// Single-symbol notional / equity cap (0 = disabled)
    #[serde(default = "default_max_symbol_exposure_pct")]
    pub max_symbol_exposure_pct: Decimal,
    /// Cash that must stay uninvested, as a share of equity
    #[serde(default = "default_cash_buffer_pct")]
    pub cash_buffer_pct: Decimal,
    /// Days a symbol stays ineligible after trading it (0 = disabled)
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: u32,
    /// Equity share risked per position (entry to stop)
    #[serde(default = "default_max_symbol_risk_pct")]
    pub max_symbol_risk_pct: Decimal,
    /// Stop distance in multiples of the volatility measure
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: Decimal,
    /// Stop distance floor as a share of price
    #[serde(default = "default_min_stop_pct")]
    pub min_stop_pct: Decimal,
    /// Per-position notional cap in USD (0 = disabled)
    #[serde(default = "default_max_position_size")]
    pub max_position_size_usd: Decimal,
    /// Per-position notional floor in USD
    #[serde(default)]
    pub min_position_size_usd: Decimal,
    /// Reject symbols that already have an open position
    #[serde(default = "default_true")]
    pub skip_if_position_open: bool,
    /// Reject symbols with any open order
    #[serde(default = "default_true")]
    pub skip_if_order_pending: bool,
    /// Price increment at or above $1
    #[serde(default = "default_tick_ge_1")]
    pub tick_ge_1: Decimal,
    /// Price increment below $1
    #[serde(default = "default_tick_lt_1")]
    pub tick_lt_1: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Take-profit distance in multiples of the volatility measure
    #[serde(default = "default_take_profit_atr_mult")]
    pub take_profit_atr_mult: Decimal,
    /// Minimum (target - entry) / (entry - stop)
    #[serde(default = "default_min_reward_risk")]
    pub min_reward_risk: Decimal,
    /// Stop-limit sits this share below the stop trigger (0 = plain stop)
    #[serde(default = "default_slippage_buffer_pct")]
    pub slippage_buffer_pct: Decimal,
    /// Gain in R that promotes the stop to break-even
    #[serde(default = "default_break_even_r")]
    pub break_even_r: Decimal,
    /// Break-even stop sits this share above entry
    #[serde(default = "default_break_even_buffer_pct")]
    pub break_even_buffer_pct: Decimal,
    /// Enable the trailing-stop promotion
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,
    /// Gain in R that switches to a trailing stop
    #[serde(default = "default_trailing_trigger_r")]
    pub trailing_trigger_r: Decimal,
    /// Trailing distance in percent of price
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: Decimal,
    /// Order time in force
    #[serde(default = "default_time_in_force")]
    pub time_in_force: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeguardsConfig {
    /// When false, no orders or protection transitions are permitted
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reset timestamp anchoring the window (absent = open-ended)
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Window length in days (0 = open-ended)
    #[serde(default)]
    pub ttl_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Price/volume snapshot TTL in seconds
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
    /// Alternative-data feature TTL in seconds
    #[serde(default = "default_alt_ttl")]
    pub alt_features_ttl_secs: u64,
    /// Optional JSON file backing the alt-feature cache across restarts
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scan ticks
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Seconds between protection ticks
    #[serde(default = "default_protection_interval")]
    pub protection_interval_secs: u64,
    /// Per-symbol budget for provider calls
    #[serde(default = "default_symbol_timeout")]
    pub symbol_timeout_secs: u64,
    /// Per-call budget for broker requests
    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_secs: u64,
    /// Run a protection pass at the start of every scan tick
    #[serde(default = "default_true")]
    pub protect_in_scan_tick: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    /// Halt all new trading
    #[serde(default)]
    pub enabled: bool,
    /// Existence of this file also halts trading
    #[serde(default = "default_kill_file")]
    pub file: Option<String>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_broker_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_paper_equity() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_max_mapping_failure_rate() -> Decimal {
    Decimal::new(50, 2) // 0.50 - majority failing aborts the scan
}

fn default_min_symbols_for_abort() -> usize {
    4
}

fn default_feed_dir() -> String {
    "data/features".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_rate_limit_cooldown() -> u64 {
    300
}

fn default_min_price() -> Decimal {
    Decimal::new(3, 0)
}

fn default_max_price() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_strict_thresholds() -> LiquidityThresholds {
    LiquidityThresholds {
        min_market_cap: Decimal::new(1_000_000_000, 0),
        min_avg_volume: Decimal::new(300_000, 0),
        max_volatility_pct: Decimal::new(8, 0),
        require_positive_trend: false,
    }
}

impl Default for LiquidityThresholds {
    fn default() -> Self {
        default_strict_thresholds()
    }
}

fn default_relaxed_thresholds() -> LiquidityThresholds {
    LiquidityThresholds {
        min_market_cap: Decimal::new(300_000_000, 0),
        min_avg_volume: Decimal::new(100_000, 0),
        max_volatility_pct: Decimal::new(12, 0),
        require_positive_trend: false,
    }
}

fn default_missing_market_cap() -> MissingMarketCapPolicy {
    MissingMarketCapPolicy::Zero
}

fn default_fast_lane_lookback() -> u32 {
    3
}

fn default_fast_lane_insider_buys() -> Decimal {
    Decimal::new(2, 0)
}

fn default_fast_lane_contract_amount() -> Decimal {
    Decimal::new(10_000_000, 0)
}

fn default_fast_lane_momentum() -> Decimal {
    Decimal::ZERO
}

fn default_alt_max_age_days() -> u32 {
    7
}

fn default_min_insider_buys() -> Decimal {
    Decimal::ONE
}

fn default_min_house_purchases() -> Decimal {
    Decimal::ONE
}

fn default_min_active_categories() -> usize {
    2
}

fn default_alt_categories() -> Vec<String> {
    features::ALT_CATEGORIES.iter().map(|s| s.to_string()).collect()
}

fn default_weights() -> HashMap<String, Decimal> {
    HashMap::from([
        (features::INSIDER_BUY_COUNT.to_string(), dec!(2)),
        (features::GOV_CONTRACT_COUNT.to_string(), dec!(1.5)),
        (features::HOUSE_PURCHASE_COUNT.to_string(), dec!(1.5)),
        (features::PATENT_MOMENTUM.to_string(), dec!(0.5)),
        (features::SEC13F_CHANGE_PCT.to_string(), dec!(0.1)),
        (features::SOCIAL_MENTIONS.to_string(), dec!(0.01)),
        (features::TREND_POSITIVE.to_string(), dec!(1)),
    ])
}

fn default_caps() -> HashMap<String, Decimal> {
    HashMap::from([
        (features::INSIDER_BUY_COUNT.to_string(), dec!(5)),
        (features::GOV_CONTRACT_COUNT.to_string(), dec!(3)),
        (features::HOUSE_PURCHASE_COUNT.to_string(), dec!(3)),
        (features::PATENT_MOMENTUM.to_string(), dec!(10)),
        (features::SEC13F_CHANGE_PCT.to_string(), dec!(20)),
        (features::SOCIAL_MENTIONS.to_string(), dec!(500)),
        (features::TREND_POSITIVE.to_string(), dec!(1)),
    ])
}

fn default_daily_max_spend() -> Decimal {
    Decimal::new(3_000, 0)
}

fn default_daily_max_new_positions() -> u32 {
    5
}

fn default_max_total_open_positions() -> u32 {
    10
}

fn default_max_exposure_pct() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_max_symbol_exposure_pct() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_cash_buffer_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_cooldown_days() -> u32 {
    5
}

fn default_max_symbol_risk_pct() -> Decimal {
    Decimal::new(1, 2) // 0.01 - one percent of equity per trade
}

fn default_atr_multiplier() -> Decimal {
    Decimal::new(2, 0)
}

fn default_min_stop_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_max_position_size() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_tick_ge_1() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_tick_lt_1() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_take_profit_atr_mult() -> Decimal {
    Decimal::new(3, 0)
}

fn default_min_reward_risk() -> Decimal {
    Decimal::new(12, 1) // 1.2
}

fn default_slippage_buffer_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_break_even_r() -> Decimal {
    Decimal::ONE
}

fn default_break_even_buffer_pct() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_trailing_trigger_r() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_trailing_pct() -> Decimal {
    Decimal::new(2, 0) // 2%
}

fn default_time_in_force() -> String {
    "day".to_string()
}

fn default_snapshot_ttl() -> u64 {
    120
}

fn default_alt_ttl() -> u64 {
    600
}

fn default_scan_interval() -> u64 {
    60
}

fn default_protection_interval() -> u64 {
    30
}

fn default_symbol_timeout() -> u64 {
    10
}

fn default_broker_timeout() -> u64 {
    15
}

fn default_db_path() -> String {
    "data/bracket_trader.db".to_string()
}

fn default_kill_file() -> Option<String> {
    Some("data/KILL".to_string())
}

fn is_fraction(value: Decimal) -> bool {
    value >= Decimal::ZERO && value <= Decimal::ONE
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::with_threshold_defaults(config::Config::builder())?
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BT"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Seed per-mode gate thresholds so overriding one field keeps the
    /// remaining defaults of that mode.
    fn with_threshold_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let mut builder = builder;
        for (mode, t) in [("strict", default_strict_thresholds()), ("relaxed", default_relaxed_thresholds())] {
            builder = builder
                .set_default(format!("gate.{}.min_market_cap", mode), t.min_market_cap.to_string())?
                .set_default(format!("gate.{}.min_avg_volume", mode), t.min_avg_volume.to_string())?
                .set_default(format!("gate.{}.max_volatility_pct", mode), t.max_volatility_pct.to_string())?
                .set_default(format!("gate.{}.require_positive_trend", mode), t.require_positive_trend)?;
        }
        Ok(builder)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.broker.live {
            anyhow::ensure!(
                !self.broker.api_key.is_empty() && !self.broker.secret_key.is_empty(),
                "live trading requires broker.api_key and broker.secret_key"
            );
        }

        anyhow::ensure!(self.gate.min_price >= Decimal::ZERO, "gate.min_price must be >= 0");
        anyhow::ensure!(
            self.gate.max_price == Decimal::ZERO || self.gate.max_price > self.gate.min_price,
            "gate.max_price must be 0 (disabled) or above gate.min_price"
        );

        let (strict, relaxed) = (&self.gate.strict, &self.gate.relaxed);
        anyhow::ensure!(
            relaxed.min_market_cap <= strict.min_market_cap
                && relaxed.min_avg_volume <= strict.min_avg_volume,
            "relaxed gate floors must not exceed strict floors"
        );
        anyhow::ensure!(
            strict.max_volatility_pct == Decimal::ZERO
                || relaxed.max_volatility_pct == Decimal::ZERO
                || relaxed.max_volatility_pct >= strict.max_volatility_pct,
            "relaxed volatility ceiling must not be tighter than strict"
        );

        anyhow::ensure!(
            self.scoring.weights.values().all(|w| *w >= Decimal::ZERO),
            "scoring weights must be non-negative"
        );
        anyhow::ensure!(
            self.scoring.caps.values().all(|c| *c >= Decimal::ZERO),
            "scoring caps must be non-negative"
        );

        anyhow::ensure!(
            is_fraction(self.universe.max_mapping_failure_rate),
            "universe.max_mapping_failure_rate must be between 0 and 1"
        );

        let risk = &self.risk;
        anyhow::ensure!(
            risk.max_symbol_risk_pct > Decimal::ZERO && risk.max_symbol_risk_pct <= Decimal::ONE,
            "risk.max_symbol_risk_pct must be in (0, 1]"
        );
        anyhow::ensure!(
            risk.atr_multiplier > Decimal::ZERO || risk.min_stop_pct > Decimal::ZERO,
            "either risk.atr_multiplier or risk.min_stop_pct must be positive"
        );
        for (name, value) in [
            ("cash_buffer_pct", risk.cash_buffer_pct),
            ("min_stop_pct", risk.min_stop_pct),
            ("daily_max_spend_pct_buying_power", risk.daily_max_spend_pct_buying_power),
        ] {
            anyhow::ensure!(is_fraction(value), "risk.{} must be between 0 and 1", name);
        }
        anyhow::ensure!(
            risk.tick_ge_1 > Decimal::ZERO && risk.tick_lt_1 > Decimal::ZERO,
            "tick sizes must be positive"
        );

        let exec = &self.execution;
        anyhow::ensure!(
            exec.min_reward_risk > Decimal::ZERO,
            "execution.min_reward_risk must be positive"
        );
        anyhow::ensure!(
            exec.take_profit_atr_mult > Decimal::ZERO,
            "execution.take_profit_atr_mult must be positive"
        );
        anyhow::ensure!(
            is_fraction(exec.slippage_buffer_pct) && exec.slippage_buffer_pct < Decimal::ONE,
            "execution.slippage_buffer_pct must be in [0, 1)"
        );
        anyhow::ensure!(
            exec.trailing_trigger_r >= exec.break_even_r,
            "execution.trailing_trigger_r must not be below break_even_r"
        );
        anyhow::ensure!(
            !exec.trailing_enabled || exec.trailing_pct > Decimal::ZERO,
            "execution.trailing_pct must be positive when trailing is enabled"
        );

        anyhow::ensure!(
            self.scheduler.scan_interval_secs > 0 && self.scheduler.protection_interval_secs > 0,
            "scheduler intervals must be positive"
        );
        anyhow::ensure!(self.provider.max_attempts >= 1, "provider.max_attempts must be >= 1");

        Ok(())
    }

    /// Resolve the symbol universe: inline symbols first, then the file, deduplicated.
    pub fn load_universe(&self) -> Result<Vec<String>> {
        let mut symbols: Vec<String> = Vec::new();
        let mut push = |raw: &str| {
            let symbol = raw.trim().to_uppercase();
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        };

        for symbol in &self.universe.symbols {
            push(symbol);
        }

        if let Some(path) = &self.universe.file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read universe file {}", path))?;
            for line in text.lines() {
                let line = line.split('#').next().unwrap_or("");
                // Tolerate CSV exports: first column is the symbol
                let first = line.split(',').next().unwrap_or("");
                if first.trim().eq_ignore_ascii_case("symbol") {
                    continue;
                }
                push(first);
            }
        }

        Ok(symbols)
    }

    /// Whether trading is halted by config flag or flag file.
    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.enabled
            || self
                .kill_switch
                .file
                .as_deref()
                .map(|p| Path::new(p).exists())
                .unwrap_or(false)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            universe: UniverseConfig::default(),
            provider: ProviderConfig::default(),
            gate: GateConfig::default(),
            fast_lane: FastLaneConfig::default(),
            alt_data: AltDataConfig::default(),
            scoring: ScoringConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            safeguards: SafeguardsConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
            kill_switch: KillSwitchConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            live: false,
            api_key: String::new(),
            secret_key: String::new(),
            base_url: default_broker_base_url(),
            request_timeout_secs: default_request_timeout(),
            paper_initial_equity: default_paper_equity(),
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            file: None,
            max_mapping_failure_rate: default_max_mapping_failure_rate(),
            min_symbols_for_abort: default_min_symbols_for_abort(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            feed_dir: default_feed_dir(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_price: default_min_price(),
            max_price: default_max_price(),
            strict: default_strict_thresholds(),
            relaxed: default_relaxed_thresholds(),
            missing_market_cap: default_missing_market_cap(),
            max_snapshot_age_secs: 0,
        }
    }
}

impl Default for FastLaneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_days: default_fast_lane_lookback(),
            insider_buy_min: default_fast_lane_insider_buys(),
            contract_amount_min: default_fast_lane_contract_amount(),
            momentum_min: default_fast_lane_momentum(),
        }
    }
}

impl Default for AltDataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: default_alt_max_age_days(),
            min_insider_buys: default_min_insider_buys(),
            min_contract_amount: Decimal::ZERO,
            min_house_purchases: default_min_house_purchases(),
            min_social_mentions: Decimal::ZERO,
            min_active_categories: default_min_active_categories(),
            categories: default_alt_categories(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            caps: default_caps(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_max_spend_usd: default_daily_max_spend(),
            daily_max_spend_pct_buying_power: Decimal::ZERO,
            daily_max_new_positions: default_daily_max_new_positions(),
            max_total_open_positions: default_max_total_open_positions(),
            max_exposure_pct: default_max_exposure_pct(),
            max_symbol_exposure_pct: default_max_symbol_exposure_pct(),
            cash_buffer_pct: default_cash_buffer_pct(),
            cooldown_days: default_cooldown_days(),
            max_symbol_risk_pct: default_max_symbol_risk_pct(),
            atr_multiplier: default_atr_multiplier(),
            min_stop_pct: default_min_stop_pct(),
            max_position_size_usd: default_max_position_size(),
            min_position_size_usd: Decimal::ZERO,
            skip_if_position_open: true,
            skip_if_order_pending: true,
            tick_ge_1: default_tick_ge_1(),
            tick_lt_1: default_tick_lt_1(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            take_profit_atr_mult: default_take_profit_atr_mult(),
            min_reward_risk: default_min_reward_risk(),
            slippage_buffer_pct: default_slippage_buffer_pct(),
            break_even_r: default_break_even_r(),
            break_even_buffer_pct: default_break_even_buffer_pct(),
            trailing_enabled: true,
            trailing_trigger_r: default_trailing_trigger_r(),
            trailing_pct: default_trailing_pct(),
            time_in_force: default_time_in_force(),
        }
    }
}

impl Default for SafeguardsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            started_at: None,
            ttl_days: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl(),
            alt_features_ttl_secs: default_alt_ttl(),
            file: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            protection_interval_secs: default_protection_interval(),
            symbol_timeout_secs: default_symbol_timeout(),
            broker_timeout_secs: default_broker_timeout(),
            protect_in_scan_tick: true,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: default_kill_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_threshold_override_keeps_mode_defaults() {
        let overrides = "[gate.strict]\nmin_market_cap = \"2000000000\"\n\n[gate.relaxed]\nmin_avg_volume = \"50000\"\n";
        let config: Config = Config::with_threshold_defaults(config::Config::builder())
            .unwrap()
            .add_source(config::File::from_str(overrides, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let strict = default_strict_thresholds();
        assert_eq!(config.gate.strict.min_market_cap, dec!(2000000000));
        assert_eq!(config.gate.strict.min_avg_volume, strict.min_avg_volume);
        assert_eq!(config.gate.strict.max_volatility_pct, strict.max_volatility_pct);

        let relaxed = default_relaxed_thresholds();
        assert_eq!(config.gate.relaxed.min_avg_volume, dec!(50000));
        assert_eq!(config.gate.relaxed.min_market_cap, relaxed.min_market_cap);
        assert_eq!(config.gate.relaxed.max_volatility_pct, relaxed.max_volatility_pct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_thresholds_deserialize() {
        let t: LiquidityThresholds = serde_json::from_str(r#"{"min_market_cap":"5"}"#).unwrap();
        assert_eq!(t.min_market_cap, dec!(5));
        assert_eq!(t.min_avg_volume, default_strict_thresholds().min_avg_volume);
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let mut config = Config::default();
        config.broker.live = true;
        assert!(config.validate().is_err());

        config.broker.api_key = "key".to_string();
        config.broker.secret_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relaxed_floor_above_strict_is_rejected() {
        let mut config = Config::default();
        config.gate.relaxed.min_market_cap = config.gate.strict.min_market_cap + Decimal::ONE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_weight_is_rejected() {
        let mut config = Config::default();
        config
            .scoring
            .weights
            .insert(features::INSIDER_BUY_COUNT.to_string(), dec!(-1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_universe_dedupes_and_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("symbols.csv");
        std::fs::write(&path, "Symbol,Name\nmsft,Microsoft\n# comment\nAAPL,Apple\n\n").unwrap();

        let mut config = Config::default();
        config.universe.symbols = vec!["aapl".to_string(), "NVDA".to_string()];
        config.universe.file = Some(path.to_string_lossy().to_string());

        let universe = config.load_universe().unwrap();
        assert_eq!(universe, vec!["AAPL", "NVDA", "MSFT"]);
    }

    #[test]
    fn test_kill_switch_file() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("KILL");

        let mut config = Config::default();
        config.kill_switch.file = Some(flag.to_string_lossy().to_string());
        assert!(!config.kill_switch_engaged());

        std::fs::write(&flag, "").unwrap();
        assert!(config.kill_switch_engaged());
    }
}
