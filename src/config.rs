use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::schema::Interval;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Environment-style configuration. Every option can be given as a
// `KLINE_*` environment variable or as a CLI flag; the flag wins.
//
// It defines:
// - Admission limits (symbol cap, interval set, open rate)
// - Listening ports for the command and liveness surfaces
// - Upstream and storage endpoints
// - Per-step timeouts
// - Auditor cadence
//
#[derive(Parser, Debug, Clone)]
#[clap(about = "Kline stream supervisor", version)]
pub struct Config {
    #[clap(
        long,
        env = "KLINE_MAX_SYMBOLS",
        default_value_t = 100,
        help = "Maximum number of distinct symbols admitted."
    )]
    pub max_symbols: usize,

    #[clap(
        long,
        env = "KLINE_INTERVALS",
        value_delimiter = ',',
        default_value = "1m,5m,15m,1h,4h,1d,1w",
        help = "Interval set opened for every symbol, in order."
    )]
    pub intervals: Vec<Interval>,

    #[clap(
        long,
        env = "KLINE_HOST",
        default_value = "0.0.0.0",
        help = "Address both HTTP servers bind to."
    )]
    pub host: IpAddr,

    #[clap(long, env = "KLINE_PORT", default_value_t = 9999, help = "Port of the command surface.")]
    pub port: u16,

    #[clap(
        long,
        env = "KLINE_LIVENESS_PORT",
        default_value_t = 9988,
        help = "Port of the liveness surface."
    )]
    pub liveness_port: u16,

    #[clap(
        long,
        env = "KLINE_WS_URL",
        default_value = "wss://stream.binance.com:9443/ws",
        help = "Upstream kline WebSocket endpoint."
    )]
    pub ws_url: String,

    #[clap(
        long,
        env = "KLINE_REST_URL",
        default_value = "https://api.binance.com",
        help = "Upstream REST base URL used for keepalive pings."
    )]
    pub rest_url: String,

    #[clap(
        long,
        env = "KLINE_UPSTREAM",
        default_value = "binance",
        help = "Upstream client implementation."
    )]
    pub upstream: String,

    #[clap(
        long,
        env = "KLINE_REDIS_URL",
        help = "Redis URL of the candle store. Unset runs in log-only demo mode."
    )]
    pub redis_url: Option<String>,

    #[clap(
        long,
        env = "KLINE_REDIS_STREAM_MAXLEN",
        default_value_t = 10_000,
        help = "Approximate cap of each per-key Redis stream."
    )]
    pub redis_stream_maxlen: usize,

    #[clap(
        long,
        env = "KLINE_OPENS_PER_SECOND",
        default_value_t = 10,
        help = "Maximum subscription opens per second."
    )]
    pub opens_per_second: u32,

    #[clap(long, env = "KLINE_CONNECT_TIMEOUT_SECS", default_value_t = 15)]
    pub connect_timeout_secs: u64,

    #[clap(long, env = "KLINE_SUBSCRIBE_TIMEOUT_SECS", default_value_t = 15)]
    pub subscribe_timeout_secs: u64,

    #[clap(long, env = "KLINE_CLOSE_TIMEOUT_SECS", default_value_t = 5)]
    pub close_timeout_secs: u64,

    #[clap(long, env = "KLINE_INTERVAL_OPEN_TIMEOUT_SECS", default_value_t = 25)]
    pub interval_open_timeout_secs: u64,

    #[clap(long, env = "KLINE_READ_TIMEOUT_SECS", default_value_t = 10)]
    pub read_timeout_secs: u64,

    #[clap(long, env = "KLINE_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    pub write_timeout_secs: u64,

    #[clap(long, env = "KLINE_SYMBOL_TIMEOUT_SECS", default_value_t = 30)]
    pub symbol_timeout_secs: u64,

    #[clap(long, env = "KLINE_BATCH_TIMEOUT_SECS", default_value_t = 300)]
    pub batch_timeout_secs: u64,

    #[clap(
        long,
        env = "KLINE_MAX_CONNECTION_AGE_SECS",
        help = "Age after which a connection is reported as expired. Never closes anything."
    )]
    pub max_connection_age_secs: Option<u64>,

    #[clap(long, env = "KLINE_STATUS_INTERVAL_SECS", default_value_t = 60)]
    pub status_interval_secs: u64,

    #[clap(long, env = "KLINE_KEEPALIVE_INTERVAL_SECS", default_value_t = 30)]
    pub keepalive_interval_secs: u64,

    #[clap(
        long,
        env = "KLINE_SYMBOLS",
        value_delimiter = ',',
        help = "Symbols opened at start-up."
    )]
    pub symbols: Vec<String>,

    #[clap(
        long,
        env = "KLINE_LOG_LEVEL",
        default_value = "info",
        help = "Default log level (trace, debug, info, warn, error)."
    )]
    pub log_level: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Rejects settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.max_symbols == 0 {
            return invalid("max_symbols must be greater than zero");
        }
        if self.intervals.is_empty() {
            return invalid("interval set must not be empty");
        }
        let mut seen = self.intervals.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.intervals.len() {
            return invalid("interval set contains duplicates");
        }
        if self.opens_per_second == 0 {
            return invalid("opens_per_second must be greater than zero");
        }
        if self.port == self.liveness_port {
            return invalid("command and liveness ports must differ");
        }
        let timeouts = [
            self.connect_timeout_secs,
            self.subscribe_timeout_secs,
            self.close_timeout_secs,
            self.interval_open_timeout_secs,
            self.read_timeout_secs,
            self.write_timeout_secs,
            self.symbol_timeout_secs,
            self.batch_timeout_secs,
            self.status_interval_secs,
            self.keepalive_interval_secs,
        ];
        if timeouts.contains(&0) {
            return invalid("timeouts and auditor intervals must be greater than zero");
        }
        Ok(())
    }

    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn liveness_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.liveness_port)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_symbols: self.max_symbols,
            intervals: self.intervals.clone(),
            opens_per_second: self.opens_per_second,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.subscribe_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            interval_open_timeout: Duration::from_secs(self.interval_open_timeout_secs),
            max_connection_age: self.max_connection_age_secs.map(Duration::from_secs),
        }
    }

    pub fn api(&self) -> ApiTimeouts {
        ApiTimeouts {
            read: Duration::from_secs(self.read_timeout_secs),
            write: Duration::from_secs(self.write_timeout_secs),
            per_symbol: Duration::from_secs(self.symbol_timeout_secs),
            batch: Duration::from_secs(self.batch_timeout_secs),
        }
    }

    pub fn auditor(&self) -> AuditorConfig {
        AuditorConfig {
            status_interval: Duration::from_secs(self.status_interval_secs),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            rest_url: self.rest_url.clone(),
        }
    }
}

// ------------------------------------------------------------
// Supervisor settings
// ------------------------------------------------------------
//
// The subset the orchestrator and registry work with.
//
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_symbols: usize,
    pub intervals: Vec<Interval>,
    pub opens_per_second: u32,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub close_timeout: Duration,
    pub interval_open_timeout: Duration,
    /// Diagnostics only. `None` means connections never expire.
    pub max_connection_age: Option<Duration>,
}

impl SupervisorConfig {
    /// Hard ceiling on registry size.
    pub fn capacity(&self) -> usize {
        self.max_symbols * self.intervals.len()
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_symbols: 100,
            intervals: Interval::DEFAULT_SET.to_vec(),
            opens_per_second: 10,
            connect_timeout: Duration::from_secs(15),
            subscribe_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(5),
            interval_open_timeout: Duration::from_secs(25),
            max_connection_age: None,
        }
    }
}

// ------------------------------------------------------------
// Command surface timeouts
// ------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct ApiTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub per_symbol: Duration,
    pub batch: Duration,
}

impl Default for ApiTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(30),
            per_symbol: Duration::from_secs(30),
            batch: Duration::from_secs(300),
        }
    }
}

// ------------------------------------------------------------
// Auditor cadence
// ------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct AuditorConfig {
    pub status_interval: Duration,
    pub keepalive_interval: Duration,
    pub rest_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["kline-stream-supervisor"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = parse(&[]);
        assert_eq!(cfg.max_symbols, 100);
        assert_eq!(cfg.intervals, Interval::DEFAULT_SET.to_vec());
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.liveness_port, 9988);
        assert_eq!(cfg.opens_per_second, 10);
        assert!(cfg.max_connection_age_secs.is_none());
        assert!(cfg.validate().is_ok());

        let sup = cfg.supervisor();
        assert_eq!(sup.capacity(), 700);
        assert_eq!(sup.connect_timeout, Duration::from_secs(15));
        assert_eq!(sup.interval_open_timeout, Duration::from_secs(25));

        let api = cfg.api();
        assert_eq!(api.read, Duration::from_secs(10));
        assert_eq!(api.batch, Duration::from_secs(300));
    }

    #[test]
    fn parses_interval_list() {
        let cfg = parse(&["--intervals", "1m,1h,1M"]);
        assert_eq!(cfg.intervals, vec![Interval::OneMinute, Interval::OneHour, Interval::OneMonth]);
    }

    #[test]
    fn rejects_unknown_interval() {
        let argv = ["kline-stream-supervisor", "--intervals", "1m,9q"];
        assert!(Config::try_parse_from(argv).is_err());
    }

    #[test]
    fn validate_rejects_bad_settings() {
        assert!(parse(&["--max-symbols", "0"]).validate().is_err());
        assert!(parse(&["--intervals", "1m,1m"]).validate().is_err());
        assert!(parse(&["--port", "9000", "--liveness-port", "9000"]).validate().is_err());
        assert!(parse(&["--opens-per-second", "0"]).validate().is_err());
        assert!(parse(&["--close-timeout-secs", "0"]).validate().is_err());
    }
}
