use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::config::AuditorConfig;
use crate::schema::StatusSnapshot;
use crate::storage::StatusStore;

use super::orchestrator::StreamSupervisor;
use super::registry::ConnectionInfo;

/// Registry health counts from one audit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub expired: usize,
}

impl AuditReport {
    pub fn from_snapshot(snapshot: &[ConnectionInfo]) -> Self {
        let active = snapshot.iter().filter(|i| i.is_active).count();
        Self {
            total: snapshot.len(),
            active,
            inactive: snapshot.len() - active,
            expired: snapshot.iter().filter(|i| i.expired).count(),
        }
    }
}

// ============================================================
// Background auditors
// ============================================================
//
// Two periodic loops running on the scheduler:
//
//   keepalive : REST ping to the upstream + registry health + metrics
//   status    : {count, symbols} snapshot handed to the status store
//
// Both only READ the registry. Nothing here closes a connection,
// expired or not; that only happens on explicit removal, on an
// error callback or during shutdown.
//
pub struct Auditor {
    supervisor: Arc<StreamSupervisor>,
    status_store: Arc<dyn StatusStore>,
    config: AuditorConfig,
    http: reqwest::Client,
}

impl Auditor {
    pub fn new(
        supervisor: Arc<StreamSupervisor>,
        status_store: Arc<dyn StatusStore>,
        config: AuditorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building keepalive http client")?;

        Ok(Self {
            supervisor,
            status_store,
            config,
            http,
        })
    }

    /// Shared non-destructive pass: health counts plus metrics summary.
    pub async fn audit_once(&self) -> AuditReport {
        let report = self.supervisor.audit().await;
        log::info!("[METRICS] {}", self.supervisor.metrics().summary());
        report
    }

    /// GET `{rest_url}/api/v3/ping`.
    pub async fn ping_upstream(&self) -> Result<()> {
        let url = format!("{}/api/v3/ping", self.config.rest_url.trim_end_matches('/'));
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        Ok(())
    }

    /// Takes a status snapshot and persists it off the scheduler thread.
    pub async fn status_once(&self) -> Result<StatusSnapshot> {
        let snapshot = self.supervisor.status().await;

        let store = self.status_store.clone();
        let to_save = snapshot.clone();
        tokio::task::spawn_blocking(move || store.save_status(&to_save))
            .await
            .context("status write task failed")??;

        log::debug!("status saved: count={} symbols={}", snapshot.count, snapshot.symbols.len());
        Ok(snapshot)
    }

    pub async fn run_keepalive(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("keepalive auditor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.ping_upstream().await {
                        log::warn!("upstream keepalive ping failed: {:#}", e);
                    }
                    self.audit_once().await;
                }
            }
        }
    }

    pub async fn run_status(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("status auditor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.status_once().await {
                        log::error!("status snapshot not saved: {:#}", e);
                    }
                }
            }
        }
    }
}
