// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Environment-style settings (clap + KLINE_* vars)
// - schema:     Intervals, subscription keys and candle records
// - util:       Shared helpers (symbol normalization, time)
// - error:      Typed failures of the open / close protocol
// - metrics:    Lock-free runtime counters
// - upstream:   Upstream client traits and the Binance client
// - ingest:     Message normalization and hand-off to storage
// - storage:    Candle sink and status store (Redis or log-only)
// - supervisor: Registry, rate limiter, orchestrator, auditors
// - scheduler:  Single-threaded scheduler and its submit bridge
// - api:        HTTP command and liveness surfaces
//
mod api;
mod config;
mod error;
mod ingest;
mod metrics;
mod scheduler;
mod schema;
mod storage;
mod supervisor;
mod upstream;
mod util;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use rustls::crypto::{CryptoProvider, ring};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use config::Config;
use ingest::Ingestor;
use metrics::RuntimeMetrics;
use scheduler::Scheduler;
use supervisor::auditor::Auditor;
use supervisor::orchestrator::{ClientFactory, StreamSupervisor};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls)
// - Load and validate configuration
// - Build storage, the supervisor and the scheduler it lives on
// - Start the auditors and the two HTTP surfaces
// - Open start-up symbols
// - Shut everything down in order on SIGINT / SIGTERM
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow!("failed to install rustls CryptoProvider"))?;

    let config = Config::parse();
    let log_env = env_logger::Env::default().default_filter_or(config.log_level.as_str());
    env_logger::Builder::from_env(log_env).init();
    config.validate()?;

    log::info!(
        "starting kline supervisor: max_symbols={} intervals={:?} upstream={}",
        config.max_symbols,
        config.intervals,
        config.upstream
    );

    // --------------------------------------------------------
    // Storage + ingestion
    //
    // No Redis URL means DEMO mode: candles are only logged.
    // --------------------------------------------------------
    let (candle_sink, status_store) =
        storage::open_store(config.redis_url.as_deref(), config.redis_stream_maxlen)?;
    let metrics = Arc::new(RuntimeMetrics::default());
    let ingestor = Arc::new(Ingestor::new(candle_sink, metrics.clone()));

    // --------------------------------------------------------
    // Supervisor
    //
    // The upstream client is built lazily, on the first open.
    // --------------------------------------------------------
    let upstream_name = config.upstream.clone();
    let ws_url = config.ws_url.clone();
    let factory: ClientFactory = Arc::new(move || upstream::get_client(&upstream_name, &ws_url));
    let supervisor = Arc::new(StreamSupervisor::new(
        config.supervisor(),
        factory,
        ingestor,
        metrics,
    ));

    let scheduler = Scheduler::start("kline-scheduler")?;
    let tasks = scheduler.handle();

    // --------------------------------------------------------
    // Background auditors (read-only)
    // --------------------------------------------------------
    let auditors_cancel = CancellationToken::new();
    let auditor = Arc::new(Auditor::new(supervisor.clone(), status_store, config.auditor())?);
    tasks.spawn(auditor.clone().run_keepalive(auditors_cancel.clone()));
    tasks.spawn(auditor.run_status(auditors_cancel.clone()));

    // --------------------------------------------------------
    // HTTP surfaces
    //
    // Both listeners are bound before anything is spawned, so a
    // taken port aborts start-up.
    // --------------------------------------------------------
    let command_listener = api::bind("command", config.command_addr()).await?;
    let liveness_listener = api::bind("liveness", config.liveness_addr()).await?;

    let http_cancel = CancellationToken::new();
    let state = api::AppState::new(tasks.clone(), supervisor.clone(), config.api());
    let mut command_server = tokio::spawn(api::serve(
        "command",
        command_listener,
        api::command_router(state),
        http_cancel.clone(),
    ));
    let mut liveness_server = tokio::spawn(api::serve(
        "liveness",
        liveness_listener,
        api::liveness_router(),
        http_cancel.clone(),
    ));

    // --------------------------------------------------------
    // Start-up symbols, opened one after another
    // --------------------------------------------------------
    if !config.symbols.is_empty() {
        let startup = supervisor.clone();
        let symbols = config.symbols.clone();
        tasks.spawn(async move {
            for symbol in symbols {
                match startup.open_symbol(&symbol).await {
                    Ok(report) => log::info!(
                        "[STARTUP] {} ok={} failed={} skipped={}",
                        report.symbol,
                        report.success_count,
                        report.failed_count,
                        report.skipped_count
                    ),
                    Err(e) => log::warn!("[STARTUP] {} not opened: {}", symbol, e),
                }
            }
        });
    }

    // A server that stops on its own also starts the shutdown.
    let early_exit = tokio::select! {
        _ = wait_for_shutdown() => None,
        result = &mut command_server => Some(("command", result)),
        result = &mut liveness_server => Some(("liveness", result)),
    };
    if let Some((name, result)) = &early_exit {
        log::error!("{} server stopped before shutdown was requested", name);
        report_server_exit(name, result);
    }

    // --------------------------------------------------------
    // Shutdown
    //
    // 1. Auditors
    // 2. HTTP servers (stop accepting, drain in-flight requests)
    // 3. Registry-wide close sweep on the scheduler
    // 4. Scheduler thread
    // --------------------------------------------------------
    auditors_cancel.cancel();
    http_cancel.cancel();
    let early_name = early_exit.as_ref().map(|(name, _)| *name);
    for (name, server) in [("command", command_server), ("liveness", liveness_server)] {
        if early_name == Some(name) {
            continue;
        }
        report_server_exit(name, &server.await);
    }

    let sweep_timeout = config.supervisor().close_timeout * 2;
    match tasks.submit(sweep_timeout, async move { supervisor.shutdown().await }).await {
        Ok(closed) => log::info!("closed {} connections", closed),
        Err(e) => log::error!("shutdown sweep incomplete: {}", e),
    }

    tokio::task::spawn_blocking(move || scheduler.stop()).await?;
    log::info!("shutdown complete");

    match early_name {
        Some(name) => Err(anyhow!("{name} server stopped unexpectedly")),
        None => Ok(()),
    }
}

fn report_server_exit(name: &str, result: &Result<anyhow::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("{} server failed: {:#}", name, e),
        Err(e) => log::error!("{} server task failed: {}", name, e),
    }
}

// ------------------------------------------------------------
// Shutdown signal
// ------------------------------------------------------------
//
// Resolves on Ctrl-C, or SIGTERM on unix.
//
async fn wait_for_shutdown() {
    let terminate = async {
        #[cfg(unix)]
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                log::info!("SIGTERM received, initiating shutdown");
            }
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = signal::ctrl_c() => log::info!("Ctrl-C received, initiating shutdown"),
        _ = terminate => {}
    }
}
