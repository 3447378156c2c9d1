use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use crate::schema::{Interval, SubscriptionKey};
use crate::upstream::adapter::{KlineStream, Transport};

/// Lifecycle of one subscription.
///
/// `Opening -> Active` happens only through a committed open.
/// `Closing` / `Closed` are entered on explicit removal, on an error
/// callback or during shutdown. The passage of time alone never
/// moves a record out of `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Opening,
    Active,
    Closing,
    Closed,
}

/// One live subscription and its network handles.
///
/// Only reachable through the registry; fields are private so that
/// every read or write goes through a registry operation.
pub struct ConnectionRecord {
    id: u64,
    key: SubscriptionKey,
    created_at: DateTime<Utc>,
    opened: Instant,
    state: ConnectionState,
    transport: Arc<dyn Transport>,
    stream: Arc<dyn KlineStream>,
}

impl ConnectionRecord {
    pub fn new(
        id: u64,
        key: SubscriptionKey,
        transport: Arc<dyn Transport>,
        stream: Arc<dyn KlineStream>,
    ) -> Self {
        Self {
            id,
            key,
            created_at: Utc::now(),
            opened: Instant::now(),
            state: ConnectionState::Opening,
            transport,
            stream,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// Diagnostics only: nothing closes a record because it expired.
    pub fn is_expired(&self, max_age: Option<Duration>) -> bool {
        max_age.is_some_and(|age| self.opened.elapsed() >= age)
    }

    fn is_live(&self, max_age: Option<Duration>) -> bool {
        self.is_active() && !self.is_expired(max_age)
    }

    fn info(&self, max_age: Option<Duration>) -> ConnectionInfo {
        ConnectionInfo {
            symbol: self.key.symbol.clone(),
            interval: self.key.interval,
            created_at: self.created_at,
            is_active: self.is_active(),
            state: self.state,
            expired: self.is_expired(max_age),
        }
    }

    /// Closes the stream, then the transport, bounded by `timeout`.
    ///
    /// Must only be called on a record that is no longer in the map.
    /// The transport is closed even when the stream close fails.
    pub async fn close(mut self, timeout: Duration) -> anyhow::Result<()> {
        self.state = ConnectionState::Closing;

        let stream = self.stream.clone();
        let transport = self.transport.clone();
        let outcome = tokio::time::timeout(timeout, async move {
            let stream_result = stream.close().await;
            transport.close().await?;
            stream_result
        })
        .await;

        self.state = ConnectionState::Closed;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!("close of {} timed out after {:?}", self.key, timeout)),
        }
    }
}

/// Read-only copy of a record, safe to use after the lock is gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub symbol: String,
    pub interval: Interval,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(skip)]
    pub state: ConnectionState,
    #[serde(skip)]
    pub expired: bool,
}

/// Result of `RegistryGuard::insert`.
pub enum InsertOutcome {
    /// The record is now in the map. An expired or inactive record
    /// it superseded is handed back for closing.
    Inserted { replaced: Option<ConnectionRecord> },
    /// A live record already owns the key; the new one is handed back.
    Skipped(ConnectionRecord),
}

#[derive(Default)]
struct RegistryInner {
    records: HashMap<SubscriptionKey, ConnectionRecord>,
    reserved: HashSet<SubscriptionKey>,
}

/// The keyed map of live subscriptions.
///
/// A single cooperative mutex guards the map. It protects map reads
/// and writes only; network work triggered by a change always runs
/// after the guard is dropped.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    max_age: Option<Duration>,
}

impl ConnectionRegistry {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            max_age,
        }
    }

    /// Acquires the registry mutex for a multi-step critical section.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            inner: self.inner.lock().await,
            max_age: self.max_age,
        }
    }

    pub fn try_lock(&self) -> Option<RegistryGuard<'_>> {
        self.inner.try_lock().ok().map(|inner| RegistryGuard {
            inner,
            max_age: self.max_age,
        })
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn exists(&self, key: &SubscriptionKey) -> Option<ConnectionInfo> {
        self.lock().await.get(key).map(|r| r.info(self.max_age))
    }

    pub async fn remove_and_return(&self, key: &SubscriptionKey) -> Option<ConnectionRecord> {
        self.lock().await.remove(key)
    }

    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().await.snapshot()
    }

    pub async fn size(&self) -> usize {
        self.lock().await.len()
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.lock().await.symbols()
    }
}

/// Held registry mutex. Every map operation lives here so that
/// callers can compose several of them into one critical section.
pub struct RegistryGuard<'a> {
    inner: MutexGuard<'a, RegistryInner>,
    max_age: Option<Duration>,
}

impl RegistryGuard<'_> {
    pub fn get(&self, key: &SubscriptionKey) -> Option<&ConnectionRecord> {
        self.inner.records.get(key)
    }

    /// True when an active, unexpired record owns the key.
    pub fn is_live(&self, key: &SubscriptionKey) -> bool {
        self.get(key).is_some_and(|r| r.is_live(self.max_age))
    }

    /// Inserts a committed record and marks it active.
    pub fn insert(&mut self, mut record: ConnectionRecord) -> InsertOutcome {
        if self.is_live(&record.key) {
            return InsertOutcome::Skipped(record);
        }
        record.state = ConnectionState::Active;
        let replaced = self.inner.records.insert(record.key.clone(), record).map(mark_closing);
        InsertOutcome::Inserted { replaced }
    }

    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<ConnectionRecord> {
        self.inner.records.remove(key).map(mark_closing)
    }

    /// Removes the key only while it still belongs to connection `id`.
    pub fn remove_if(&mut self, key: &SubscriptionKey, id: u64) -> Option<ConnectionRecord> {
        if self.get(key).is_some_and(|r| r.id == id) {
            self.remove(key)
        } else {
            None
        }
    }

    /// Empties the map, handing every record back for closing.
    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.inner.records.drain().map(|(_, r)| mark_closing(r)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    /// Records plus opens in flight; what the symbol cap is checked against.
    pub fn occupied(&self) -> usize {
        self.inner.records.len() + self.inner.reserved.len()
    }

    pub fn is_reserved(&self, key: &SubscriptionKey) -> bool {
        self.inner.reserved.contains(key)
    }

    pub fn reserve(&mut self, key: SubscriptionKey) -> bool {
        self.inner.reserved.insert(key)
    }

    pub fn release(&mut self, key: &SubscriptionKey) {
        self.inner.reserved.remove(key);
    }

    /// Which of `intervals` already have a live record for `symbol`.
    pub fn live_intervals(&self, symbol: &str, intervals: &[Interval]) -> Vec<Interval> {
        intervals
            .iter()
            .copied()
            .filter(|interval| self.is_live(&SubscriptionKey::new(symbol, *interval)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.inner.records.values().map(|r| r.info(self.max_age)).collect();
        infos.sort_by(|a, b| (&a.symbol, a.interval).cmp(&(&b.symbol, b.interval)));
        infos
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner
            .records
            .keys()
            .map(|k| k.symbol.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn mark_closing(mut record: ConnectionRecord) -> ConnectionRecord {
    record.state = ConnectionState::Closing;
    record
}
