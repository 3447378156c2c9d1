use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime metrics for the supervisor.
///
/// Purpose:
/// - Track open / close activity against the upstream
/// - Track throughput of the ingestion pipeline
/// - Track the error classes that are logged and dropped
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Owned by the process and shared by `Arc`, so every test gets
///   its own counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    // Open protocol
    pub opens_attempted: AtomicUsize,
    pub opens_succeeded: AtomicUsize,
    pub opens_failed: AtomicUsize,
    pub rate_limit_waits: AtomicUsize,

    // Lifecycle
    pub closes: AtomicUsize,
    pub close_errors: AtomicUsize,
    pub transport_errors: AtomicUsize,

    // Ingestion
    pub messages_received: AtomicUsize,
    pub candles_in_progress: AtomicUsize,
    pub candles_stored: AtomicUsize,
    pub normalize_errors: AtomicUsize,
    pub storage_errors: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }

    /// One-line, low-noise summary for the periodic reporter.
    pub fn summary(&self) -> String {
        format!(
            "opens={}/{} open_fail={} rl_wait={} closes={} close_err={} ws_err={} \
             recv={} partial={} stored={} norm_err={} store_err={}",
            Self::get(&self.opens_succeeded),
            Self::get(&self.opens_attempted),
            Self::get(&self.opens_failed),
            Self::get(&self.rate_limit_waits),
            Self::get(&self.closes),
            Self::get(&self.close_errors),
            Self::get(&self.transport_errors),
            Self::get(&self.messages_received),
            Self::get(&self.candles_in_progress),
            Self::get(&self.candles_stored),
            Self::get(&self.normalize_errors),
            Self::get(&self.storage_errors),
        )
    }
}
