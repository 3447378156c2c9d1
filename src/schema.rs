use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ------------------------------------------------------------
// Candle interval
// ------------------------------------------------------------
//
// The upstream kline stream is published per (symbol, interval).
// Only the intervals the upstream understands are representable;
// anything else is rejected at admission time, before any network
// call is made.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Interval {
    /// Default interval set opened for every symbol.
    pub const DEFAULT_SET: [Interval; 7] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::OneHour,
        Interval::FourHours,
        Interval::OneDay,
        Interval::OneWeek,
    ];

    /// Wire name used by the upstream (`1m`, `4h`, `1M`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unsupported interval '{0}'")]
pub struct InvalidInterval(pub String);

impl FromStr for Interval {
    type Err = InvalidInterval;

    // `1M` (month) and `1m` (minute) differ only by case, so matching
    // is case-sensitive on purpose.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let interval = match raw.trim() {
            "1m" => Interval::OneMinute,
            "3m" => Interval::ThreeMinutes,
            "5m" => Interval::FiveMinutes,
            "15m" => Interval::FifteenMinutes,
            "30m" => Interval::ThirtyMinutes,
            "1h" => Interval::OneHour,
            "2h" => Interval::TwoHours,
            "4h" => Interval::FourHours,
            "6h" => Interval::SixHours,
            "8h" => Interval::EightHours,
            "12h" => Interval::TwelveHours,
            "1d" => Interval::OneDay,
            "3d" => Interval::ThreeDays,
            "1w" => Interval::OneWeek,
            "1M" => Interval::OneMonth,
            other => return Err(InvalidInterval(other.to_string())),
        };
        Ok(interval)
    }
}

// ------------------------------------------------------------
// Subscription key
// ------------------------------------------------------------
//
// Identifies exactly one logical subscription. The symbol is
// always stored in its normalized (upper-case) form so that
// "btcusdt" and "BTCUSDT" never produce two registry entries.
//
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: crate::util::normalize_symbol(symbol),
            interval,
        }
    }

    /// Upstream stream name, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ------------------------------------------------------------
// Normalized candle
// ------------------------------------------------------------
//
// One completed OHLCV bucket, as handed to the storage sink.
//
// DESIGN NOTES:
// - Only closed candles are ever normalized into this type.
// - Times are epoch milliseconds, exactly as published upstream.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trade_count: u64,
    pub taker_buy_base_volume: f64,
    pub taker_buy_quote_volume: f64,
}

// ------------------------------------------------------------
// Status snapshot
// ------------------------------------------------------------
//
// Periodically computed by the status auditor and persisted by
// an external collaborator (see storage::StatusStore).
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub count: usize,
    pub symbols: Vec<String>,
    pub generated_at: DateTime<Utc>,
}
