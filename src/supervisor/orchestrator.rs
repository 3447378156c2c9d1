use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::time::timeout;

use crate::config::SupervisorConfig;
use crate::error::{OpenStep, StreamError};
use crate::ingest::Ingestor;
use crate::metrics::RuntimeMetrics;
use crate::schema::{Interval, StatusSnapshot, SubscriptionKey};
use crate::upstream::adapter::{StreamClient, StreamEvents, Transport};
use crate::util;

use super::auditor::AuditReport;
use super::handler::SubscriptionHandler;
use super::rate_limiter::{RateDecision, RateLimiter};
use super::registry::{
    ConnectionInfo, ConnectionRecord, ConnectionRegistry, InsertOutcome, RegistryGuard,
};

/// Builds the shared upstream client on first use.
pub type ClientFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn StreamClient>> + Send + Sync>;

/// Per-symbol outcome of `open_symbol`.
///
/// Partial completion is a valid result: nothing is rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SymbolOpenReport {
    pub symbol: String,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opens, tracks and closes kline subscriptions.
///
/// Lives on the scheduler: every method is meant to run there, and
/// the registry it owns is never touched from anywhere else.
///
/// DESIGN:
/// - One subscription key → one transport connection
/// - Failures are isolated per key and never escalate
/// - Network closes always happen after the registry lock is dropped
///
pub struct StreamSupervisor {
    config: SupervisorConfig,
    registry: Arc<ConnectionRegistry>,
    limiter: RateLimiter,
    client: OnceCell<Arc<dyn StreamClient>>,
    client_factory: ClientFactory,
    ingestor: Arc<Ingestor>,
    metrics: Arc<RuntimeMetrics>,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        client_factory: ClientFactory,
        ingestor: Arc<Ingestor>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new(config.max_connection_age)),
            limiter: RateLimiter::per_second(config.opens_per_second),
            client: OnceCell::new(),
            config,
            client_factory,
            ingestor,
            metrics,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Opens one subscription. Succeeds immediately, without any
    /// network call, when a live record already owns the key.
    pub async fn open_stream(&self, symbol: &str, interval: Interval) -> Result<(), StreamError> {
        let key = self.admission_key(symbol, interval)?;

        // 1. Admission, under the registry lock.
        let (reservation, superseded) = {
            let mut guard = self.registry.lock().await;
            if guard.is_live(&key) {
                log::debug!("[{}] already live", key);
                return Ok(());
            }
            if guard.is_reserved(&key) {
                return Err(StreamError::OpenInProgress(key.to_string()));
            }

            let superseded = guard.remove(&key);
            let limit = self.config.capacity();
            if guard.occupied() >= limit {
                drop(guard);
                if let Some(stale) = superseded {
                    self.close_record(stale).await;
                }
                log::warn!("[{}] rejected: capacity of {} streams reached", key, limit);
                return Err(StreamError::CapacityExceeded { limit });
            }

            guard.reserve(key.clone());
            (Reservation::new(&self.registry, key.clone()), superseded)
        };

        if let Some(stale) = superseded {
            log::info!("[{}] superseding inactive or expired connection", key);
            self.close_record(stale).await;
        }

        RuntimeMetrics::incr(&self.metrics.opens_attempted);
        match self.open_reserved(&key, reservation).await {
            Ok(()) => {
                RuntimeMetrics::incr(&self.metrics.opens_succeeded);
                log::info!("[{}] stream live", key);
                Ok(())
            }
            Err(e) => {
                RuntimeMetrics::incr(&self.metrics.opens_failed);
                log::warn!("[{}] open failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Steps 2-7 of the open protocol for an admitted key.
    async fn open_reserved(
        &self,
        key: &SubscriptionKey,
        reservation: Reservation<'_>,
    ) -> Result<(), StreamError> {
        // 2. Client readiness
        let client = self.client().await?;

        // 3. Rate-limit gate
        self.rate_gate(key).await?;

        // 4. Transport connect
        let transport = match timeout(self.config.connect_timeout, client.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(StreamError::Connect(format!("{e:#}"))),
            Err(_) => {
                return Err(StreamError::StepTimeout {
                    step: OpenStep::Connect,
                    timeout: self.config.connect_timeout,
                });
            }
        };

        // 5. Error-handler wiring (non-fatal)
        let connection_id = self.registry.next_id();
        let handler: Arc<dyn StreamEvents> = Arc::new(SubscriptionHandler::new(
            key.clone(),
            connection_id,
            Handle::current(),
            self.registry.clone(),
            self.ingestor.clone(),
            self.metrics.clone(),
            self.config.close_timeout,
        ));
        if let Err(e) = transport.set_error_handler(handler.clone()) {
            log::warn!("[{}] transport error handler not wired, continuing: {:#}", key, e);
        }

        // 6. Subscribe
        let subscribe = transport.subscribe(&key.symbol, key.interval);
        let stream = match timeout(self.config.subscribe_timeout, subscribe).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.discard_transport(key, transport.as_ref()).await;
                return Err(StreamError::Subscribe(format!("{e:#}")));
            }
            Err(_) => {
                self.discard_transport(key, transport.as_ref()).await;
                return Err(StreamError::StepTimeout {
                    step: OpenStep::Subscribe,
                    timeout: self.config.subscribe_timeout,
                });
            }
        };

        // 7. Message-handler wiring + commit
        let wiring = stream.set_handler(handler);
        let record = ConnectionRecord::new(connection_id, key.clone(), transport, stream);
        if let Err(e) = wiring {
            self.close_record(record).await;
            return Err(StreamError::Wiring(format!("{e:#}")));
        }

        let outcome = {
            let mut guard = self.registry.lock().await;
            reservation.commit(&mut guard);
            guard.insert(record)
        };
        match outcome {
            InsertOutcome::Inserted { replaced: None } => {}
            InsertOutcome::Inserted { replaced: Some(old) } => self.close_record(old).await,
            InsertOutcome::Skipped(duplicate) => self.close_record(duplicate).await,
        }
        Ok(())
    }

    /// Opens every configured interval of `symbol`.
    ///
    /// Intervals that are already live are skipped; the rest are
    /// attempted in configured order, each bounded by its own
    /// timeout so a stuck interval cannot hold up the others.
    pub async fn open_symbol(&self, symbol: &str) -> Result<SymbolOpenReport, StreamError> {
        let symbol = util::normalize_symbol(symbol);
        if !util::is_valid_symbol(&symbol) {
            return Err(StreamError::InvalidSymbol(symbol));
        }

        let intervals = &self.config.intervals;
        let skipped = self.registry.lock().await.live_intervals(&symbol, intervals);

        let mut report = SymbolOpenReport {
            symbol: symbol.clone(),
            skipped_count: skipped.len(),
            total_count: intervals.len(),
            ..Default::default()
        };
        let mut errors = Vec::new();

        for interval in intervals.iter().copied().filter(|i| !skipped.contains(i)) {
            let limit = self.config.interval_open_timeout;
            match timeout(limit, self.open_stream(&symbol, interval)).await {
                Ok(Ok(())) => report.success_count += 1,
                Ok(Err(e)) => {
                    if e.is_admission() {
                        log::info!("[{}@{}] not admitted: {}", symbol, interval, e);
                    }
                    report.failed_count += 1;
                    errors.push(format!("{interval}: {e}"));
                }
                Err(_) => {
                    report.failed_count += 1;
                    let e = StreamError::StepTimeout {
                        step: OpenStep::Interval,
                        timeout: limit,
                    };
                    log::warn!("[{}@{}] {}", symbol, interval, e);
                    errors.push(format!("{interval}: {e}"));
                }
            }
        }

        if !errors.is_empty() {
            report.error = Some(errors.join("; "));
        }

        log::info!(
            "[{}] open_symbol ok={} failed={} skipped={} total={}",
            symbol,
            report.success_count,
            report.failed_count,
            report.skipped_count,
            report.total_count
        );
        Ok(report)
    }

    /// Removes the key, then closes its handles outside the lock.
    /// Returns false if the key was not present.
    pub async fn close_stream(&self, symbol: &str, interval: Interval) -> bool {
        let key = SubscriptionKey::new(symbol, interval);
        let Some(record) = self.registry.remove_and_return(&key).await else {
            return false;
        };
        log::info!("[{}] removed by request", key);
        self.close_record(record).await;
        true
    }

    /// Looks up one key without touching its handles.
    pub async fn connection(&self, symbol: &str, interval: Interval) -> Option<ConnectionInfo> {
        self.registry.exists(&SubscriptionKey::new(symbol, interval)).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.size().await
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot().await
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.registry.symbols().await
    }

    pub async fn status(&self) -> StatusSnapshot {
        let guard = self.registry.lock().await;
        StatusSnapshot {
            count: guard.len(),
            symbols: guard.symbols(),
            generated_at: chrono::Utc::now(),
        }
    }

    /// Non-destructive health pass: reports, never closes.
    pub async fn audit(&self) -> AuditReport {
        let snapshot = self.registry.snapshot().await;
        for info in snapshot.iter().filter(|i| i.expired) {
            log::info!(
                "[{}@{}] past max connection age (created {}), left open",
                info.symbol,
                info.interval,
                info.created_at
            );
        }
        let report = AuditReport::from_snapshot(&snapshot);
        log::info!(
            "[AUDIT] total={} active={} inactive={} expired={}",
            report.total,
            report.active,
            report.inactive,
            report.expired
        );
        report
    }

    /// Full-shutdown sweep: collect every record under the lock,
    /// close them all outside it. Individual failures are logged.
    pub async fn shutdown(&self) -> usize {
        let records = self.registry.lock().await.drain();
        let count = records.len();
        log::info!("shutdown: closing {} connections", count);

        futures_util::future::join_all(records.into_iter().map(|r| self.close_record(r))).await;
        count
    }

    fn admission_key(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<SubscriptionKey, StreamError> {
        let key = SubscriptionKey::new(symbol, interval);
        if !util::is_valid_symbol(&key.symbol) {
            return Err(StreamError::InvalidSymbol(symbol.to_string()));
        }
        if !self.config.intervals.contains(&interval) {
            return Err(StreamError::IntervalNotConfigured(interval));
        }
        Ok(key)
    }

    async fn client(&self) -> Result<Arc<dyn StreamClient>, StreamError> {
        self.client
            .get_or_try_init(|| async {
                let client = (self.client_factory)()?;
                log::info!("upstream client '{}' ready", client.name());
                Ok::<_, anyhow::Error>(client)
            })
            .await
            .cloned()
            .map_err(|e| StreamError::ClientInit(format!("{e:#}")))
    }

    async fn rate_gate(&self, key: &SubscriptionKey) -> Result<(), StreamError> {
        let RateDecision::Deny { wait } = self.limiter.try_open() else {
            return Ok(());
        };

        RuntimeMetrics::incr(&self.metrics.rate_limit_waits);
        log::debug!("[{}] rate limited, waiting {:?}", key, wait);
        tokio::time::sleep(wait).await;

        match self.limiter.try_open() {
            RateDecision::Allow => Ok(()),
            RateDecision::Deny { wait } => Err(StreamError::RateLimited {
                wait_ms: wait.as_millis() as u64,
            }),
        }
    }

    async fn close_record(&self, record: ConnectionRecord) {
        let key = record.key().clone();
        log::debug!("[{}] closing connection #{} ({:?})", key, record.id(), record.state());
        RuntimeMetrics::incr(&self.metrics.closes);
        if let Err(e) = record.close(self.config.close_timeout).await {
            RuntimeMetrics::incr(&self.metrics.close_errors);
            log::warn!("[{}] close failed: {:#}", key, e);
        }
    }

    /// Closes a transport that never made it into the registry.
    async fn discard_transport(&self, key: &SubscriptionKey, transport: &dyn Transport) {
        match timeout(self.config.close_timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[{}] closing partial connection failed: {:#}", key, e),
            Err(_) => log::warn!("[{}] closing partial connection timed out", key),
        }
    }
}

// ------------------------------------------------------------
// Open-in-flight reservation
// ------------------------------------------------------------
//
// Holds the key's admission slot while steps 2-7 run. Released on
// commit, or on drop when the open fails or its future is cancelled
// by an outer timeout.
//
struct Reservation<'a> {
    registry: &'a Arc<ConnectionRegistry>,
    key: Option<SubscriptionKey>,
}

impl<'a> Reservation<'a> {
    fn new(registry: &'a Arc<ConnectionRegistry>, key: SubscriptionKey) -> Self {
        Self {
            registry,
            key: Some(key),
        }
    }

    fn commit(mut self, guard: &mut RegistryGuard<'_>) {
        if let Some(key) = self.key.take() {
            guard.release(&key);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(mut guard) = self.registry.try_lock() {
            guard.release(&key);
            return;
        }
        let registry = self.registry.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.lock().await.release(&key);
                });
            }
            Err(_) => log::error!("[{}] reservation leaked: no runtime to release it on", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::kline_frame;
    use crate::storage::MemoryStore;
    use crate::upstream::mock::MockClient;
    use futures_util::future::{join, join3, join_all};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        supervisor: StreamSupervisor,
        mock: Arc<MockClient>,
        store: Arc<MemoryStore>,
        factory_calls: Arc<AtomicUsize>,
    }

    fn harness(config: SupervisorConfig) -> Harness {
        let mock = Arc::new(MockClient::new());
        let store = Arc::new(MemoryStore::default());
        let metrics = Arc::new(RuntimeMetrics::default());
        let factory_calls = Arc::new(AtomicUsize::new(0));

        let client: Arc<dyn StreamClient> = mock.clone();
        let calls = factory_calls.clone();
        let factory: ClientFactory = Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(client.clone())
        });

        let ingestor = Arc::new(Ingestor::new(store.clone(), metrics.clone()));
        let supervisor = StreamSupervisor::new(config, factory, ingestor, metrics);
        mock.watch_registry(supervisor.registry().clone());

        Harness {
            supervisor,
            mock,
            store,
            factory_calls,
        }
    }

    fn key(symbol: &str, interval: Interval) -> SubscriptionKey {
        SubscriptionKey::new(symbol, interval)
    }

    async fn wait_until_size(supervisor: &StreamSupervisor, expected: usize) {
        for _ in 0..200 {
            if supervisor.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("registry never reached {} entries", expected);
    }

    #[tokio::test]
    async fn open_commits_an_active_record() {
        let h = harness(SupervisorConfig::default());

        h.supervisor.open_stream("btcusdt", Interval::OneMinute).await.unwrap();

        let info = h.supervisor.connection("BTCUSDT", Interval::OneMinute).await.unwrap();
        assert!(info.is_active);
        assert_eq!(h.mock.connects(), 1);
        assert_eq!(h.mock.subscribes(), 1);
        assert!(h.mock.transport(0).stream(0).has_handler());
        assert_eq!(RuntimeMetrics::get(&h.supervisor.metrics().opens_succeeded), 1);
    }

    #[tokio::test]
    async fn open_is_idempotent_for_live_keys() {
        let h = harness(SupervisorConfig::default());

        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();
        let opens_in_window = h.supervisor.limiter.in_window();
        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();

        assert_eq!(h.mock.connects(), 1);
        assert_eq!(h.mock.subscribes(), 1);
        assert_eq!(h.supervisor.limiter.in_window(), opens_in_window);
        assert_eq!(h.supervisor.connection_count().await, 1);
    }

    #[tokio::test]
    async fn client_is_built_once() {
        let h = harness(SupervisorConfig::default());
        for interval in [Interval::OneMinute, Interval::FiveMinutes, Interval::OneHour] {
            h.supervisor.open_stream("ETHUSDT", interval).await.unwrap();
        }
        assert_eq!(h.factory_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cap_is_enforced_before_any_network_call() {
        let h = harness(SupervisorConfig {
            max_symbols: 1,
            intervals: vec![Interval::OneMinute, Interval::FiveMinutes],
            ..Default::default()
        });

        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();
        h.supervisor.open_stream("BTCUSDT", Interval::FiveMinutes).await.unwrap();
        let err = h.supervisor.open_stream("ETHUSDT", Interval::OneMinute).await.unwrap_err();

        assert!(matches!(err, StreamError::CapacityExceeded { limit: 2 }));
        assert!(err.is_admission());
        assert_eq!(h.mock.connects(), 2);
    }

    #[tokio::test]
    async fn unconfigured_interval_and_bad_symbol_are_rejected() {
        let h = harness(SupervisorConfig {
            intervals: vec![Interval::OneMinute],
            ..Default::default()
        });

        let err = h.supervisor.open_stream("BTCUSDT", Interval::FiveMinutes).await.unwrap_err();
        assert!(matches!(err, StreamError::IntervalNotConfigured(Interval::FiveMinutes)));
        let err = h.supervisor.open_stream("BTC USDT", Interval::OneMinute).await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidSymbol(_)));
        assert_eq!(h.mock.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn excess_opens_wait_for_the_next_window() {
        let h = harness(SupervisorConfig {
            opens_per_second: 2,
            ..Default::default()
        });
        let started = tokio::time::Instant::now();

        for symbol in ["AAAUSDT", "BBBUSDT"] {
            h.supervisor.open_stream(symbol, Interval::OneMinute).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        h.supervisor.open_stream("CCCUSDT", Interval::OneMinute).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(h.supervisor.limiter.in_window(), 1);
        assert_eq!(RuntimeMetrics::get(&h.supervisor.metrics().rate_limit_waits), 1);
    }

    #[tokio::test]
    async fn connect_failure_leaves_no_trace() {
        let h = harness(SupervisorConfig::default());
        h.mock.fail_connect_on(1);

        let err = h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap_err();
        assert!(matches!(err, StreamError::Connect(_)));
        assert_eq!(h.supervisor.connection_count().await, 0);
        assert_eq!(h.supervisor.registry().lock().await.occupied(), 0);

        // The reservation was released, so a retry goes through.
        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();
        assert_eq!(h.supervisor.connection_count().await, 1);
    }

    #[tokio::test]
    async fn subscribe_failure_closes_the_transport() {
        let h = harness(SupervisorConfig::default());
        h.mock.fail_subscribe(Interval::OneMinute);

        let err = h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap_err();

        assert!(matches!(err, StreamError::Subscribe(_)));
        assert!(h.mock.transport(0).is_closed());
        assert_eq!(h.supervisor.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_timeout_closes_the_transport() {
        let h = harness(SupervisorConfig::default());
        h.mock.hang_subscribe(Interval::OneMinute);

        let err = h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap_err();

        assert!(matches!(err, StreamError::StepTimeout { step: OpenStep::Subscribe, .. }));
        assert!(h.mock.transport(0).is_closed());
        assert_eq!(h.supervisor.connection_count().await, 0);
    }

    #[tokio::test]
    async fn error_handler_wiring_failure_is_not_fatal() {
        let h = harness(SupervisorConfig::default());
        h.mock.fail_error_wiring();

        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();
        assert_eq!(h.supervisor.connection_count().await, 1);
    }

    #[tokio::test]
    async fn open_symbol_reports_partial_batches() {
        let h = harness(SupervisorConfig::default());
        for interval in [Interval::OneMinute, Interval::FiveMinutes, Interval::FifteenMinutes] {
            h.supervisor.open_stream("BTCUSDT", interval).await.unwrap();
        }
        // 1h, 4h, 1d, 1w connect 4th..7th; 4h gets refused.
        h.mock.fail_connect_on(5);

        let report = h.supervisor.open_symbol("BTCUSDT").await.unwrap();

        assert_eq!(report.success_count, 3);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.skipped_count, 3);
        assert_eq!(report.total_count, 7);
        assert!(report.error.unwrap().starts_with("4h: connect failed"));
        assert_eq!(h.supervisor.connection_count().await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_interval_does_not_block_the_others() {
        let h = harness(SupervisorConfig {
            connect_timeout: Duration::from_secs(60),
            ..Default::default()
        });
        h.mock.hang_connect_on(1);

        let report = h.supervisor.open_symbol("ETHUSDT").await.unwrap();

        assert_eq!(report.success_count, 6);
        assert_eq!(report.failed_count, 1);
        assert!(report.error.unwrap().contains("interval open timed out"));

        // The cancelled open gave its reservation back.
        assert_eq!(h.supervisor.registry().lock().await.occupied(), 6);
        h.supervisor.open_stream("ETHUSDT", Interval::OneMinute).await.unwrap();
        assert_eq!(h.supervisor.connection_count().await, 7);
    }

    #[tokio::test]
    async fn close_happens_after_the_key_left_the_map() {
        let h = harness(SupervisorConfig::default());
        let k = key("BTCUSDT", Interval::OneHour);
        h.supervisor.open_stream("BTCUSDT", Interval::OneHour).await.unwrap();

        assert!(h.supervisor.close_stream("BTCUSDT", Interval::OneHour).await);
        assert!(!h.supervisor.close_stream("BTCUSDT", Interval::OneHour).await);

        assert_eq!(h.mock.close_observations(), vec![(k, false)]);
        assert!(h.mock.transport(0).is_closed());
        assert!(h.mock.transport(0).stream(0).is_closed());
    }

    #[tokio::test]
    async fn concurrent_closes_start_after_their_key_left_the_map() {
        const FIRST: [&str; 4] = ["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];
        const SECOND: [&str; 4] = ["ADAUSDT", "BNBUSDT", "DOTUSDT", "LTCUSDT"];
        const THIRD: [&str; 4] = ["TRXUSDT", "XLMUSDT", "AVAXUSDT", "LINKUSDT"];
        let h = harness(SupervisorConfig {
            opens_per_second: 100,
            ..Default::default()
        });
        let sup = &h.supervisor;
        let m1 = Interval::OneMinute;

        for symbol in FIRST {
            sup.open_stream(symbol, m1).await.unwrap();
        }

        // Explicit closes race opens of other keys.
        let (closed, opened) = join(
            join_all(FIRST.map(|s| sup.close_stream(s, m1))),
            join_all(SECOND.map(|s| sup.open_stream(s, m1))),
        )
        .await;
        assert!(closed.iter().all(|removed| *removed));
        assert!(opened.iter().all(Result::is_ok));

        // A full sweep races explicit closes and fresh opens.
        let (swept, closed, opened) = join3(
            sup.shutdown(),
            join_all(SECOND.map(|s| sup.close_stream(s, m1))),
            join_all(THIRD.map(|s| sup.open_stream(s, m1))),
        )
        .await;
        assert!(opened.iter().all(Result::is_ok));
        let removed_by_close = closed.iter().filter(|removed| **removed).count();
        assert!(swept + removed_by_close >= SECOND.len());

        sup.shutdown().await;
        assert_eq!(sup.connection_count().await, 0);

        let observations = h.mock.close_observations();
        assert_eq!(observations.len(), 12);
        assert!(observations.iter().all(|(_, still_mapped)| !still_mapped));
        for i in 0..12 {
            assert!(h.mock.transport(i).is_closed());
        }
    }

    #[tokio::test]
    async fn transport_error_removes_and_closes_the_key() {
        let h = harness(SupervisorConfig::default());
        let k = key("SOLUSDT", Interval::OneDay);
        h.supervisor.open_stream("SOLUSDT", Interval::OneDay).await.unwrap();

        h.mock.transport_for(&k).unwrap().fail("connection reset");
        wait_until_size(&h.supervisor, 0).await;

        for _ in 0..100 {
            if h.mock.transport(0).is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.mock.transport(0).is_closed());
        assert_eq!(h.mock.close_observations(), vec![(k, false)]);
        assert_eq!(RuntimeMetrics::get(&h.supervisor.metrics().transport_errors), 1);

        // No silent reconnect: the key stays closed until asked again.
        h.supervisor.open_stream("SOLUSDT", Interval::OneDay).await.unwrap();
        assert_eq!(h.mock.connects(), 2);
    }

    #[tokio::test]
    async fn stream_error_removes_the_key() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.open_stream("XRPUSDT", Interval::FourHours).await.unwrap();

        h.mock.transport(0).stream(0).fail("invalid stream");
        wait_until_size(&h.supervisor, 0).await;
        assert_eq!(RuntimeMetrics::get(&h.supervisor.metrics().transport_errors), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_error_from_superseded_connection_is_ignored() {
        let h = harness(SupervisorConfig {
            max_connection_age: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let k = key("BNBUSDT", Interval::OneMinute);
        h.supervisor.open_stream("BNBUSDT", Interval::OneMinute).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        h.supervisor.open_stream("BNBUSDT", Interval::OneMinute).await.unwrap();
        assert!(h.mock.transport(0).is_closed());
        assert_eq!(h.mock.connects(), 2);

        h.mock.transport(0).fail("late failure");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.supervisor.connection(&k.symbol, k.interval).await.is_some());
        assert!(!h.mock.transport(1).is_closed());
    }

    #[tokio::test]
    async fn closed_candles_flow_to_the_store() {
        let h = harness(SupervisorConfig::default());
        let k = key("BTCUSDT", Interval::OneMinute);
        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();

        let transport = h.mock.transport_for(&k).unwrap();
        transport.emit(Some(&kline_frame(false)));
        transport.emit(Some(&kline_frame(true)));
        transport.emit(None);

        for _ in 0..200 {
            if !h.store.candles.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.store.candles.lock().unwrap().len(), 1);
        assert_eq!(RuntimeMetrics::get(&h.supervisor.metrics().normalize_errors), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.open_symbol("BTCUSDT").await.unwrap();

        assert_eq!(h.supervisor.shutdown().await, 7);
        assert_eq!(h.supervisor.connection_count().await, 0);
        for i in 0..7 {
            assert!(h.mock.transport(i).is_closed());
        }
        assert!(h.mock.close_observations().iter().all(|(_, mapped)| !mapped));
    }

    #[tokio::test]
    async fn status_lists_distinct_symbols() {
        let h = harness(SupervisorConfig::default());
        h.supervisor.open_stream("ETHUSDT", Interval::OneMinute).await.unwrap();
        h.supervisor.open_stream("BTCUSDT", Interval::OneMinute).await.unwrap();
        h.supervisor.open_stream("BTCUSDT", Interval::OneHour).await.unwrap();

        let status = h.supervisor.status().await;
        assert_eq!(status.count, 3);
        assert_eq!(status.symbols, vec!["BTCUSDT", "ETHUSDT"]);
    }
}
