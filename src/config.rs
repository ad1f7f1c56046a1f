// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable parameter of the swing engine and its market-data trackers
// lives here. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash. All fields carry `#[serde(default)]` so that adding
// new fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradeDirection;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_trade_amount() -> f64 {
    0.001
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_rsi_period() -> usize {
    14
}

fn default_rsi_high() -> f64 {
    70.0
}

fn default_rsi_low() -> f64 {
    30.0
}

fn default_signal_symbol() -> String {
    "ETHBTC".to_string()
}

fn default_signal_interval() -> String {
    "4h".to_string()
}

fn default_kline_limit() -> u32 {
    500
}

fn default_stop_loss_pct() -> f64 {
    0.05
}

fn default_max_close_slippage_pct() -> f64 {
    0.05
}

fn default_price_tick() -> f64 {
    0.1
}

fn default_qty_step() -> f64 {
    0.001
}

fn default_max_log_entries() -> usize {
    200
}

fn default_stop_debounce_ms() -> u64 {
    5000
}

fn default_order_lock_ttl_ms() -> u64 {
    30_000
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_depth_speed_ms() -> u64 {
    100
}

fn default_imbalance_ratio() -> f64 {
    2.0
}

fn default_depth_window_bps() -> f64 {
    9.0
}

fn default_refresh_sync_ms() -> u64 {
    30_000
}

fn default_rate_limit_max_pause_ms() -> u64 {
    60_000
}

// =============================================================================
// DepthTrackerConfig
// =============================================================================

/// Settings for the incremental depth tracker (one symbol per instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthTrackerConfig {
    /// WebSocket raw-stream base, e.g. `wss://stream.binance.com:9443/ws`.
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// REST base for depth snapshots, e.g. `https://api.binance.com`.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Diff stream cadence in milliseconds (`@depth@<speed>ms`).
    #[serde(default = "default_depth_speed_ms")]
    pub speed_ms: u64,

    /// Buy/sell dominance ratio for the skip flags. Floored at 1.01.
    #[serde(default = "default_imbalance_ratio")]
    pub imbalance_ratio: f64,

    /// Near-touch window in basis points around best bid/ask.
    #[serde(default = "default_depth_window_bps")]
    pub depth_window_bps: f64,

    /// Interval between full snapshot resyncs while the book is ready.
    #[serde(default = "default_refresh_sync_ms")]
    pub refresh_sync_ms: u64,
}

impl Default for DepthTrackerConfig {
    fn default() -> Self {
        Self {
            ws_base_url: default_ws_base_url(),
            rest_base_url: default_rest_base_url(),
            speed_ms: default_depth_speed_ms(),
            imbalance_ratio: default_imbalance_ratio(),
            depth_window_bps: default_depth_window_bps(),
            refresh_sync_ms: default_refresh_sync_ms(),
        }
    }
}

// =============================================================================
// SwingConfig
// =============================================================================

/// Top-level configuration for the swing engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingConfig {
    /// Traded symbol.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Which sides the strategy may open.
    #[serde(default)]
    pub direction: TradeDirection,

    /// Quantity per market entry, in base asset units.
    #[serde(default = "default_trade_amount")]
    pub trade_amount: f64,

    /// Tick loop cadence.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // --- RSI signal ----------------------------------------------------------
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_rsi_high")]
    pub rsi_high: f64,

    #[serde(default = "default_rsi_low")]
    pub rsi_low: f64,

    /// Symbol the RSI signal is computed on (may differ from the traded one).
    #[serde(default = "default_signal_symbol")]
    pub signal_symbol: String,

    /// Kline interval of the RSI signal.
    #[serde(default = "default_signal_interval")]
    pub signal_interval: String,

    /// How many historical klines seed the RSI on (re)bootstrap.
    #[serde(default = "default_kline_limit")]
    pub signal_kline_limit: u32,

    // --- Risk ----------------------------------------------------------------
    /// Stop-loss distance from entry, as a fraction (0.05 = 5 %).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Maximum tolerated slippage on market orders, as a fraction.
    #[serde(default = "default_max_close_slippage_pct")]
    pub max_close_slippage_pct: f64,

    // --- Venue precision -----------------------------------------------------
    /// Price tick size for stop-price quantisation.
    #[serde(default = "default_price_tick")]
    pub price_tick: f64,

    /// Quantity step for order-size quantisation.
    #[serde(default = "default_qty_step")]
    pub qty_step: f64,

    // --- Housekeeping --------------------------------------------------------
    /// Maximum entries retained in the in-memory trade log.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,

    /// Window during which identical stop submissions are suppressed.
    #[serde(default = "default_stop_debounce_ms")]
    pub stop_debounce_ms: u64,

    /// Deadline after which an unresolved order-slot lock expires.
    #[serde(default = "default_order_lock_ttl_ms")]
    pub order_lock_ttl_ms: u64,

    /// Ceiling of the rate-limit backoff pause.
    #[serde(default = "default_rate_limit_max_pause_ms")]
    pub rate_limit_max_pause_ms: u64,

    /// Depth tracker settings for the signal feed.
    #[serde(default)]
    pub depth: DepthTrackerConfig,
}

impl Default for SwingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            direction: TradeDirection::default(),
            trade_amount: default_trade_amount(),
            poll_interval_ms: default_poll_interval_ms(),
            rsi_period: default_rsi_period(),
            rsi_high: default_rsi_high(),
            rsi_low: default_rsi_low(),
            signal_symbol: default_signal_symbol(),
            signal_interval: default_signal_interval(),
            signal_kline_limit: default_kline_limit(),
            stop_loss_pct: default_stop_loss_pct(),
            max_close_slippage_pct: default_max_close_slippage_pct(),
            price_tick: default_price_tick(),
            qty_step: default_qty_step(),
            max_log_entries: default_max_log_entries(),
            stop_debounce_ms: default_stop_debounce_ms(),
            order_lock_ttl_ms: default_order_lock_ttl_ms(),
            rate_limit_max_pause_ms: default_rate_limit_max_pause_ms(),
            depth: DepthTrackerConfig::default(),
        }
    }
}

impl SwingConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            direction = %config.direction,
            signal = %format!("{}@{}", config.signal_symbol, config.signal_interval),
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
