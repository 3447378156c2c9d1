//! Upstream client registry and factory
//!
//! This module provides:
//! - The capability traits the supervisor drives (`adapter`)
//! - The concrete Binance kline client
//! - A factory resolving a client implementation by name
//!
//! The rest of the application interacts with the upstream
//! exclusively through the traits in `adapter`.

pub mod adapter;
pub mod binance;
#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use anyhow::bail;

use adapter::StreamClient;

/// Returns an upstream client instance by name.
///
/// CONTRACT:
/// - `name` must match the `KLINE_UPSTREAM` setting
/// - Names are lowercase and stable
///
pub fn get_client(name: &str, ws_url: &str) -> anyhow::Result<Arc<dyn StreamClient>> {
    match name {
        "binance" => Ok(Arc::new(binance::BinanceClient::new(ws_url))),
        other => bail!("upstream '{}' is not supported", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_clients_only() {
        let client = get_client("binance", "wss://example.invalid/ws").unwrap();
        assert_eq!(client.name(), "binance");
        assert!(get_client("kraken", "wss://example.invalid/ws").is_err());
    }
}
