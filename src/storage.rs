use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::schema::{Candle, StatusSnapshot};

/// Time-series sink for completed candles.
///
/// CONTRACT:
/// - Blocking; callers run it off the scheduler thread
/// - Best-effort batch insert, failures are returned to the caller
/// - Must be safe to call from several threads at once
pub trait CandleSink: Send + Sync {
    fn insert_batch(&self, candles: &[Candle]) -> Result<usize>;
}

/// Persists the periodic `{count, symbols}` status snapshot.
pub trait StatusStore: Send + Sync {
    fn save_status(&self, status: &StatusSnapshot) -> Result<()>;
}

/// Builds the configured store.
///
/// DEMO MODE:
/// - No Redis URL configured
/// - Candles and status snapshots are only logged
pub fn open_store(
    redis_url: Option<&str>,
    stream_maxlen: usize,
) -> Result<(Arc<dyn CandleSink>, Arc<dyn StatusStore>)> {
    match redis_url {
        Some(url) => {
            let store = Arc::new(RedisStore::open(url, stream_maxlen)?);
            log::info!("candle store: redis (stream maxlen ~{})", stream_maxlen);
            Ok((store.clone(), store))
        }
        None => {
            log::warn!("candle store running in DEMO mode, nothing is persisted");
            let store = Arc::new(LogStore);
            Ok((store.clone(), store))
        }
    }
}

// ============================================================
// RedisStore
// ============================================================
//
// Appends each candle as JSON to a capped per-key stream:
//
//     XADD kline:{SYMBOL}:{interval} MAXLEN ~ N * data {json}
//
// and keeps the latest status snapshot under `kline:status`.
//
// The connection is cached and dropped on the first error so that
// the next batch reconnects.
pub struct RedisStore {
    client: redis::Client,
    stream_maxlen: usize,
    conn: Mutex<Option<redis::Connection>>,
}

pub const STATUS_KEY: &str = "kline:status";

impl RedisStore {
    pub fn open(url: &str, stream_maxlen: usize) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            stream_maxlen,
            conn: Mutex::new(None),
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut cached = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = match cached.take() {
            Some(conn) => conn,
            None => self.client.get_connection()?,
        };
        let value = op(&mut conn)?;
        *cached = Some(conn);
        Ok(value)
    }
}

pub fn stream_key(candle: &Candle) -> String {
    format!("kline:{}:{}", candle.symbol, candle.interval)
}

impl CandleSink for RedisStore {
    fn insert_batch(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for candle in candles {
            pipe.cmd("XADD")
                .arg(stream_key(candle))
                .arg("MAXLEN")
                .arg("~")
                .arg(self.stream_maxlen)
                .arg("*")
                .arg("data")
                .arg(serde_json::to_string(candle)?)
                .ignore();
        }

        self.with_connection(|conn| pipe.query::<()>(conn))?;
        Ok(candles.len())
    }
}

impl StatusStore for RedisStore {
    fn save_status(&self, status: &StatusSnapshot) -> Result<()> {
        let json = serde_json::to_string(status)?;
        self.with_connection(|conn| redis::cmd("SET").arg(STATUS_KEY).arg(&json).query::<()>(conn))
    }
}

// ============================================================
// LogStore
// ============================================================
pub struct LogStore;

impl CandleSink for LogStore {
    fn insert_batch(&self, candles: &[Candle]) -> Result<usize> {
        for candle in candles {
            log::info!("DEMO candle → {}", serde_json::to_string(candle)?);
        }
        Ok(candles.len())
    }
}

impl StatusStore for LogStore {
    fn save_status(&self, status: &StatusSnapshot) -> Result<()> {
        log::info!("DEMO status → {}", serde_json::to_string(status)?);
        Ok(())
    }
}

// ============================================================
// MemoryStore (tests)
// ============================================================
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    pub candles: Mutex<Vec<Candle>>,
    pub statuses: Mutex<Vec<StatusSnapshot>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl CandleSink for MemoryStore {
    fn insert_batch(&self, candles: &[Candle]) -> Result<usize> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("store unavailable (scripted)");
        }
        self.candles.lock().unwrap().extend_from_slice(candles);
        Ok(candles.len())
    }
}

#[cfg(test)]
impl StatusStore for MemoryStore {
    fn save_status(&self, status: &StatusSnapshot) -> Result<()> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}
