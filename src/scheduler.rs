use std::future::Future;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The caller stopped waiting. The unit of work itself keeps
    /// running on the scheduler until it finishes on its own.
    #[error("scheduler task timed out after {0:?}")]
    Timeout(Duration),

    #[error("scheduler is stopped")]
    Stopped,

    #[error("scheduler task failed: {0}")]
    TaskFailed(String),
}

// ============================================================
// Scheduler
// ============================================================
//
// A single-threaded tokio runtime parked on its own OS thread.
// Every registry, rate-limiter and upstream operation runs here,
// so they interleave only at await points.
//
// HTTP workers never touch that state directly: they hand a future
// to `SchedulerHandle::submit` and wait for its result with a
// bound.
//
pub struct Scheduler {
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(name: &str) -> anyhow::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            runtime.block_on(async {
                let _ = stop_rx.await;
            });
            runtime.shutdown_timeout(Duration::from_secs(5));
        })?;

        log::info!("scheduler '{}' started", name);
        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            runtime: self.handle.clone(),
        }
    }

    /// Stops the runtime and joins its thread. Tasks still pending
    /// are dropped. Blocking.
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("scheduler thread panicked");
            }
        }
        log::info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Cloneable, thread-safe entry point into the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    runtime: Handle,
}

impl SchedulerHandle {
    /// Runs `fut` on the scheduler and waits at most `timeout`.
    pub async fn submit<F, T>(&self, timeout: Duration, fut: F) -> Result<T, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.runtime.spawn(fut);
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_cancelled() => Err(SchedulerError::Stopped),
            Ok(Err(e)) => Err(SchedulerError::TaskFailed(e.to_string())),
            Err(_) => Err(SchedulerError::Timeout(timeout)),
        }
    }

    /// Fire-and-forget, for long-running loops such as the auditors.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(fut)
    }
}
