use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::ingest::Ingestor;
use crate::metrics::RuntimeMetrics;
use crate::schema::SubscriptionKey;
use crate::upstream::adapter::StreamEvents;

use super::registry::ConnectionRegistry;

/// Callback adapter wired into one subscription's transport and
/// stream.
///
/// Its only job is to schedule work onto the scheduler and return:
/// - messages go to the ingestion pipeline
/// - errors schedule removal of this connection from the registry,
///   followed by a bounded close outside the registry lock
pub struct SubscriptionHandler {
    key: SubscriptionKey,
    connection_id: u64,
    runtime: Handle,
    registry: Arc<ConnectionRegistry>,
    ingestor: Arc<Ingestor>,
    metrics: Arc<RuntimeMetrics>,
    close_timeout: Duration,
}

impl SubscriptionHandler {
    pub fn new(
        key: SubscriptionKey,
        connection_id: u64,
        runtime: Handle,
        registry: Arc<ConnectionRegistry>,
        ingestor: Arc<Ingestor>,
        metrics: Arc<RuntimeMetrics>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            key,
            connection_id,
            runtime,
            registry,
            ingestor,
            metrics,
            close_timeout,
        }
    }
}

impl StreamEvents for SubscriptionHandler {
    fn on_message(&self, raw: Option<&str>) {
        self.ingestor
            .on_message(&self.runtime, self.key.clone(), raw.map(str::to_owned));
    }

    fn on_error(&self, error: &str) {
        RuntimeMetrics::incr(&self.metrics.transport_errors);
        log::warn!("[{}] upstream error: {}", self.key, error);

        let key = self.key.clone();
        let id = self.connection_id;
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let close_timeout = self.close_timeout;

        self.runtime.spawn(async move {
            // A later connection may already own the key; leave it alone.
            let removed = registry.lock().await.remove_if(&key, id);
            let Some(record) = removed else {
                return;
            };

            log::info!("[{}] removed after upstream error", key);
            RuntimeMetrics::incr(&metrics.closes);
            if let Err(e) = record.close(close_timeout).await {
                RuntimeMetrics::incr(&metrics.close_errors);
                log::warn!("[{}] close after error failed: {}", key, e);
            }
        });
    }
}
