//! Utility helpers shared by the supervisor and the ingestion pipeline.
//!
//! IMPORTANT:
//! - No upstream-specific protocol logic should live here.
//! - This module must remain lightweight and deterministic.

/// Normalize a trading symbol into the internal registry format.
///
/// Target format: upper-case, no separators, e.g. `BTCUSDT`.
///
/// Examples:
/// - "btcusdt"   -> "BTCUSDT"
/// - "BTC/USDT"  -> "BTCUSDT"
/// - "eth-usdt"  -> "ETHUSDT"
///
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '/' | '_' | '-'))
        .collect::<String>()
        .to_uppercase()
}

/// A symbol is usable when it is non-empty and purely alphanumeric
/// after normalization.
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty() && symbol.chars().all(|c| c.is_ascii_alphanumeric())
}
