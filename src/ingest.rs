use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::metrics::RuntimeMetrics;
use crate::schema::{Candle, Interval, SubscriptionKey};
use crate::storage::CandleSink;
use crate::util;

// ------------------------------------------------------------
// Normalization
// ------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' is not numeric")]
    NotNumeric(&'static str),

    #[error("unsupported interval '{0}'")]
    UnknownInterval(String),
}

/// Outcome of normalizing one upstream frame.
#[derive(Debug, PartialEq)]
pub enum Normalized {
    /// No candle payload in the frame (acks, other events).
    NoPayload,
    /// Candle still forming; the common case, never an error.
    InProgress,
    Closed(Candle),
}

/// Extracts a completed candle from a raw kline frame.
///
/// Accepts the raw (`{"e":"kline","k":{..}}`) and combined
/// (`{"stream":..,"data":{..}}`) forms. Prices arrive as decimal
/// strings; plain JSON numbers are accepted as well.
///
/// Structural validation only applies to closed candles: an open
/// candle with missing fields is simply skipped.
pub fn normalize(raw: &str) -> Result<Normalized, NormalizeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;

    let data = value.get("data").unwrap_or(&value);
    let kline = match data.get("k") {
        Some(k) if k.is_object() => k,
        _ => return Ok(Normalized::NoPayload),
    };

    let closed = kline
        .get("x")
        .ok_or(NormalizeError::MissingField("x"))?
        .as_bool()
        .ok_or(NormalizeError::MissingField("x"))?;
    if !closed {
        return Ok(Normalized::InProgress);
    }

    let symbol = kline
        .get("s")
        .or_else(|| data.get("s"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("s"))?;
    let interval_raw = kline
        .get("i")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("i"))?;
    let interval: Interval = interval_raw
        .parse()
        .map_err(|_| NormalizeError::UnknownInterval(interval_raw.to_string()))?;

    Ok(Normalized::Closed(Candle {
        symbol: util::normalize_symbol(symbol),
        interval,
        open_time: required_i64(kline, "t")?,
        close_time: required_i64(kline, "T")?,
        open: required_f64(kline, "o")?,
        high: required_f64(kline, "h")?,
        low: required_f64(kline, "l")?,
        close: required_f64(kline, "c")?,
        volume: required_f64(kline, "v")?,
        quote_volume: optional_f64(kline, "q")?,
        trade_count: optional_i64(kline, "n")?.max(0) as u64,
        taker_buy_base_volume: optional_f64(kline, "V")?,
        taker_buy_quote_volume: optional_f64(kline, "Q")?,
    }))
}

fn numeric_f64(value: &Value, field: &'static str) -> Result<f64, NormalizeError> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).ok_or(NormalizeError::NotNumeric(field))
}

fn numeric_i64(value: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    let parsed = match value {
        Value::String(s) => s.parse::<i64>().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    };
    parsed.ok_or(NormalizeError::NotNumeric(field))
}

fn required_f64(kline: &Value, field: &'static str) -> Result<f64, NormalizeError> {
    numeric_f64(kline.get(field).ok_or(NormalizeError::MissingField(field))?, field)
}

fn required_i64(kline: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    numeric_i64(kline.get(field).ok_or(NormalizeError::MissingField(field))?, field)
}

fn optional_f64(kline: &Value, field: &'static str) -> Result<f64, NormalizeError> {
    kline.get(field).map_or(Ok(0.0), |v| numeric_f64(v, field))
}

fn optional_i64(kline: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    kline.get(field).map_or(Ok(0), |v| numeric_i64(v, field))
}

// ------------------------------------------------------------
// Ingestion pipeline
// ------------------------------------------------------------

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Empty,
    NoPayload,
    InProgress,
    Invalid,
    Stored,
    StoreFailed,
}

/// Per-message normalization and hand-off to the candle sink.
///
/// `on_message` is what upstream callbacks call: it schedules the
/// work and returns, so the transport's delivery path never waits
/// on parsing or storage.
pub struct Ingestor {
    sink: Arc<dyn CandleSink>,
    metrics: Arc<RuntimeMetrics>,
}

impl Ingestor {
    pub fn new(sink: Arc<dyn CandleSink>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self { sink, metrics }
    }

    pub fn on_message(
        self: &Arc<Self>,
        runtime: &Handle,
        key: SubscriptionKey,
        raw: Option<String>,
    ) {
        let this = self.clone();
        runtime.spawn(async move {
            this.ingest(&key, raw.as_deref()).await;
        });
    }

    pub async fn ingest(&self, key: &SubscriptionKey, raw: Option<&str>) -> IngestOutcome {
        RuntimeMetrics::incr(&self.metrics.messages_received);

        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return IngestOutcome::Empty;
        };

        let candle = match normalize(raw) {
            Ok(Normalized::Closed(candle)) => candle,
            Ok(Normalized::InProgress) => {
                RuntimeMetrics::incr(&self.metrics.candles_in_progress);
                log::trace!("[{}] candle in progress", key);
                return IngestOutcome::InProgress;
            }
            Ok(Normalized::NoPayload) => return IngestOutcome::NoPayload,
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.normalize_errors);
                log::error!("[{}] normalization failed: {}", key, e);
                return IngestOutcome::Invalid;
            }
        };

        log::debug!("[{}] closed candle open_time={}", key, candle.open_time);

        let sink = self.sink.clone();
        let written =
            tokio::task::spawn_blocking(move || sink.insert_batch(std::slice::from_ref(&candle)))
                .await;

        match written {
            Ok(Ok(_)) => {
                RuntimeMetrics::incr(&self.metrics.candles_stored);
                IngestOutcome::Stored
            }
            Ok(Err(e)) => {
                RuntimeMetrics::incr(&self.metrics.storage_errors);
                log::error!("[{}] candle insert failed: {}", key, e);
                IngestOutcome::StoreFailed
            }
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.storage_errors);
                log::error!("[{}] candle insert task failed: {}", key, e);
                IngestOutcome::StoreFailed
            }
        }
    }
}
