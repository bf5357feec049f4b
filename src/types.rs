// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Candle width. The symbolic code (`"1m"`, `"4h"`, ...) is what travels over
/// the wire and in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    pub const ALL: [Interval; 5] = [
        Self::OneMinute,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    /// Bucket length in seconds.
    pub const fn seconds(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::FifteenMinutes => 900,
            Self::OneHour => 3_600,
            Self::FourHours => 14_400,
            Self::OneDay => 86_400,
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    /// Start of the bucket containing `time` (seconds). Floors towards
    /// negative infinity so pre-epoch stamps still land on a boundary.
    pub fn bucket_start(self, time: i64) -> i64 {
        time.div_euclid(self.seconds()) * self.seconds()
    }

    pub fn is_aligned(self, bucket_start: i64) -> bool {
        bucket_start.rem_euclid(self.seconds()) == 0
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::OneMinute
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|iv| iv.code() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unsupported interval: {s}"))
    }
}

/// Which market of the exchange the stream is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Future,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Future => write!(f, "future"),
        }
    }
}

impl FromStr for MarketType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "future" | "futures" => Ok(Self::Future),
            other => anyhow::bail!("unsupported market type: {other}"),
        }
    }
}

/// Severity attached to an upstream control/log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Missing or unknown severities read as `Info`.
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("success") => Self::Success,
            Some("warning") => Self::Warning,
            Some("error") => Self::Error,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// The (symbol, interval, market) triple a candle store belongs to, plus the
/// generation tag that changes on every reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextKey {
    pub symbol: String,
    pub interval: Interval,
    pub market_type: MarketType,
    pub generation: u64,
}

impl ContextKey {
    /// Exchange-style symbol without separator, e.g. `BTC/USDT` -> `BTCUSDT`.
    pub fn stream_symbol(&self) -> String {
        self.symbol.replace('/', "").to_uppercase()
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}:{}#{}",
            self.symbol, self.interval, self.market_type, self.generation
        )
    }
}
