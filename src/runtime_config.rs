// =============================================================================
// Runtime Configuration — feed settings with atomic save
// =============================================================================
//
// Every field carries a serde default so that older config files keep loading
// after new settings are added. Environment variables (optionally from a
// `.env` file) override whatever the file says.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Interval, MarketType};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_upstream_base() -> String {
    "ws://localhost:8000".to_string()
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_symbol() -> String {
    "BTC/USDT".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_throttle_ms() -> u64 {
    100
}

fn default_reconnect_delay_secs() -> u64 {
    3
}

fn default_max_candles() -> usize {
    1000
}

fn default_max_control_logs() -> usize {
    50
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Upstream ------------------------------------------------------------

    /// Base URL of the market-data relay, e.g. `ws://localhost:8000`.
    #[serde(default = "default_upstream_base")]
    pub upstream_base: String,

    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Seconds to wait between reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    // --- Context at startup ---------------------------------------------------

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default)]
    pub interval: Interval,

    #[serde(default)]
    pub market_type: MarketType,

    // --- Aggregation & rendering ---------------------------------------------

    /// Minimum spacing between two pushes to renderers.
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// Candles retained per context; the oldest are dropped first.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    #[serde(default = "default_max_control_logs")]
    pub max_control_logs: usize,

    // --- API -------------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            upstream_base: default_upstream_base(),
            exchange: default_exchange(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            symbol: default_symbol(),
            interval: Interval::default(),
            market_type: MarketType::default(),
            throttle_ms: default_throttle_ms(),
            max_candles: default_max_candles(),
            max_control_logs: default_max_control_logs(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            market_type = %config.market_type,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `CANDLE_FEED_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base) = lookup("CANDLE_FEED_UPSTREAM") {
            self.upstream_base = base.trim_end_matches('/').to_string();
        }
        if let Some(exchange) = lookup("CANDLE_FEED_EXCHANGE") {
            self.exchange = exchange.trim().to_lowercase();
        }
        if let Some(symbol) = lookup("CANDLE_FEED_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Some(raw) = lookup("CANDLE_FEED_INTERVAL") {
            match raw.parse() {
                Ok(interval) => self.interval = interval,
                Err(e) => warn!(error = %e, "ignoring CANDLE_FEED_INTERVAL"),
            }
        }
        if let Some(raw) = lookup("CANDLE_FEED_MARKET") {
            match raw.parse() {
                Ok(market_type) => self.market_type = market_type,
                Err(e) => warn!(error = %e, "ignoring CANDLE_FEED_MARKET"),
            }
        }
        if let Some(addr) = lookup("CANDLE_FEED_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }
}
