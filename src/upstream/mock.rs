//! Scriptable in-memory upstream used by the test suite.
//!
//! Records every connect / subscribe / close and lets a test fail or
//! hang individual steps, fire callbacks, and observe the registry at
//! the moment a close starts.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::schema::{Interval, SubscriptionKey};
use crate::supervisor::registry::ConnectionRegistry;

use super::adapter::{KlineStream, StreamClient, StreamEvents, Transport};

#[derive(Default)]
struct Script {
    fail_connect_on: HashSet<usize>,
    hang_connect_on: HashSet<usize>,
    fail_subscribe: HashSet<Interval>,
    hang_subscribe: HashSet<Interval>,
    fail_error_wiring: bool,
}

#[derive(Default)]
pub struct MockClient {
    script: Mutex<Script>,
    connects: AtomicUsize,
    subscribes: Arc<AtomicUsize>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    watcher: Mutex<Option<Arc<ConnectionRegistry>>>,
    close_observations: Arc<Mutex<Vec<(SubscriptionKey, bool)>>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the n-th connect (1-based).
    pub fn fail_connect_on(&self, nth: usize) {
        self.script.lock().unwrap().fail_connect_on.insert(nth);
    }

    /// Makes the n-th connect (1-based) never complete.
    pub fn hang_connect_on(&self, nth: usize) {
        self.script.lock().unwrap().hang_connect_on.insert(nth);
    }

    pub fn fail_subscribe(&self, interval: Interval) {
        self.script.lock().unwrap().fail_subscribe.insert(interval);
    }

    pub fn hang_subscribe(&self, interval: Interval) {
        self.script.lock().unwrap().hang_subscribe.insert(interval);
    }

    pub fn fail_error_wiring(&self) {
        self.script.lock().unwrap().fail_error_wiring = true;
    }

    /// Every transport close records whether its key was still in
    /// `registry` when the close started.
    pub fn watch_registry(&self, registry: Arc<ConnectionRegistry>) {
        *self.watcher.lock().unwrap() = Some(registry);
    }

    pub fn close_observations(&self) -> Vec<(SubscriptionKey, bool)> {
        self.close_observations.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }

    /// The most recent transport subscribed to `key`.
    pub fn transport_for(&self, key: &SubscriptionKey) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.key.lock().unwrap().as_ref() == Some(key))
            .cloned()
    }
}

#[async_trait::async_trait]
impl StreamClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let nth = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (fail, hang, fail_wiring, subscribe_faults) = {
            let script = self.script.lock().unwrap();
            (
                script.fail_connect_on.contains(&nth),
                script.hang_connect_on.contains(&nth),
                script.fail_error_wiring,
                (script.fail_subscribe.clone(), script.hang_subscribe.clone()),
            )
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            bail!("connection refused (scripted)");
        }

        let transport = Arc::new(MockTransport {
            key: Mutex::new(None),
            error_handler: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_wiring,
            fail_subscribe: subscribe_faults.0,
            hang_subscribe: subscribe_faults.1,
            subscribes: self.subscribes.clone(),
            watcher: self.watcher.lock().unwrap().clone(),
            close_observations: self.close_observations.clone(),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct MockTransport {
    key: Mutex<Option<SubscriptionKey>>,
    error_handler: Mutex<Option<Arc<dyn StreamEvents>>>,
    streams: Mutex<Vec<Arc<MockStream>>>,
    closed: AtomicBool,
    fail_wiring: bool,
    fail_subscribe: HashSet<Interval>,
    hang_subscribe: HashSet<Interval>,
    subscribes: Arc<AtomicUsize>,
    watcher: Option<Arc<ConnectionRegistry>>,
    close_observations: Arc<Mutex<Vec<(SubscriptionKey, bool)>>>,
}

impl MockTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stream(&self, index: usize) -> Arc<MockStream> {
        self.streams.lock().unwrap()[index].clone()
    }

    /// Fires the transport error callback, as a socket failure would.
    pub fn fail(&self, reason: &str) {
        let handler = self.error_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_error(reason);
        }
    }

    /// Delivers a frame to the first stream's message callback.
    pub fn emit(&self, raw: Option<&str>) {
        let stream = self.streams.lock().unwrap().first().cloned();
        if let Some(stream) = stream {
            stream.emit(raw);
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn set_error_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()> {
        if self.fail_wiring {
            bail!("error handler wiring failed (scripted)");
        }
        *self.error_handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> anyhow::Result<Arc<dyn KlineStream>> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        *self.key.lock().unwrap() = Some(SubscriptionKey::new(symbol, interval));

        if self.hang_subscribe.contains(&interval) {
            std::future::pending::<()>().await;
        }
        if self.fail_subscribe.contains(&interval) {
            bail!("subscribe rejected (scripted)");
        }

        let stream = Arc::new(MockStream {
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn close(&self) -> anyhow::Result<()> {
        let key = self.key.lock().unwrap().clone();
        if let (Some(registry), Some(key)) = (&self.watcher, key) {
            let still_mapped = registry.exists(&key).await.is_some();
            self.close_observations.lock().unwrap().push((key, still_mapped));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockStream {
    handler: Mutex<Option<Arc<dyn StreamEvents>>>,
    closed: AtomicBool,
}

impl MockStream {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    pub fn emit(&self, raw: Option<&str>) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_message(raw);
        }
    }

    pub fn fail(&self, reason: &str) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_error(reason);
        }
    }
}

#[async_trait::async_trait]
impl KlineStream for MockStream {
    fn set_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()> {
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
