//! HTTP command and liveness surfaces.
//!
//! Handlers run on the multi-threaded runtime and never touch the
//! registry themselves: every unit of work is submitted to the
//! scheduler and awaited with a bound. A timed-out unit is reported
//! to its caller only; other in-flight units are unaffected.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ApiTimeouts;
use crate::error::StreamError;
use crate::scheduler::{SchedulerError, SchedulerHandle};
use crate::schema::{Interval, SubscriptionKey};
use crate::supervisor::orchestrator::{StreamSupervisor, SymbolOpenReport};
use crate::supervisor::registry::ConnectionInfo;

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Stream(e) => match e {
                StreamError::InvalidSymbol(_) | StreamError::IntervalNotConfigured(_) => {
                    StatusCode::BAD_REQUEST
                }
                StreamError::CapacityExceeded { .. } | StreamError::OpenInProgress(_) => {
                    StatusCode::CONFLICT
                }
                StreamError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                StreamError::StepTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                StreamError::ClientInit(_)
                | StreamError::Connect(_)
                | StreamError::Subscribe(_)
                | StreamError::Wiring(_) => StatusCode::BAD_GATEWAY,
            },
            Self::Scheduler(e) => match e {
                SchedulerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
                SchedulerError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

// Malformed bodies and query strings get the same JSON error shape
// as every other failure instead of axum's plain-text rejection.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed: {}", self);
        }
        (
            status,
            Json(ErrorBody {
                status: "error",
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

// ============================================================
// State
// ============================================================

#[derive(Clone)]
pub struct AppState {
    scheduler: SchedulerHandle,
    supervisor: Arc<StreamSupervisor>,
    timeouts: ApiTimeouts,
}

impl AppState {
    pub fn new(
        scheduler: SchedulerHandle,
        supervisor: Arc<StreamSupervisor>,
        timeouts: ApiTimeouts,
    ) -> Self {
        Self {
            scheduler,
            supervisor,
            timeouts,
        }
    }

    /// Runs `work` against the supervisor on the scheduler.
    async fn run<F, Fut, T>(&self, timeout: Duration, work: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(Arc<StreamSupervisor>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.submit(timeout, work(self.supervisor.clone())).await
    }
}

// ============================================================
// Bodies
// ============================================================

#[derive(Debug, Serialize, PartialEq)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: String,
}

impl MessageResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub connection_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SymbolsResponse {
    pub symbols: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub connection_count: usize,
    pub symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub symbol: String,
    pub interval: String,
}

impl StreamRequest {
    fn interval(&self) -> Result<Interval, ApiError> {
        self.interval
            .parse::<Interval>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct SymbolsRequest {
    pub symbols: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub total_symbols: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_symbols: Vec<String>,
    pub duration_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub status: &'static str,
    pub results: Vec<SymbolOpenReport>,
    pub current_status: Option<StatusResponse>,
    pub summary: BatchSummary,
}

// ============================================================
// Routers
// ============================================================

pub fn command_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/connections/count", get(connection_count))
        .route("/connections/list", get(list_connections))
        .route("/symbols", get(list_symbols))
        .route("/status", get(status))
        .route("/streams/info", get(stream_info))
        .route("/streams/add", post(add_stream))
        .route("/streams/remove", post(remove_stream))
        .route("/symbols/add", post(add_symbols))
        .with_state(state)
}

/// Answers `/ping` only, without going through the scheduler.
pub fn liveness_router() -> Router {
    Router::new().route("/ping", get(ping))
}

/// Binds the listener for the `name` surface.
///
/// Done up front so that a taken port stops start-up instead of
/// failing later inside a detached server task.
pub async fn bind(name: &'static str, addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {name} server to {addr}"))?;
    log::info!("{} server listening on {}", name, addr);
    Ok(listener)
}

/// Serves `router` on `listener` until `cancel` fires.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            log::info!("{} server shutting down", name);
        })
        .await
        .with_context(|| format!("{name} server"))?;
    Ok(())
}

// ============================================================
// Handlers
// ============================================================

/// GET /ping
pub async fn ping() -> Json<MessageResponse> {
    Json(MessageResponse::ok("pong"))
}

/// GET /connections/count
pub async fn connection_count(State(state): State<AppState>) -> ApiResult<CountResponse> {
    let connection_count = state
        .run(state.timeouts.read, |sup| async move { sup.connection_count().await })
        .await?;
    Ok(Json(CountResponse { connection_count }))
}

/// GET /connections/list
pub async fn list_connections(State(state): State<AppState>) -> ApiResult<ListResponse> {
    let connections = state
        .run(state.timeouts.read, |sup| async move { sup.connections().await })
        .await?;
    Ok(Json(ListResponse {
        count: connections.len(),
        connections,
    }))
}

/// GET /symbols
pub async fn list_symbols(State(state): State<AppState>) -> ApiResult<SymbolsResponse> {
    let symbols = state
        .run(state.timeouts.read, |sup| async move { sup.symbols().await })
        .await?;
    Ok(Json(SymbolsResponse {
        count: symbols.len(),
        symbols,
    }))
}

/// GET /status
///
/// Also runs one non-destructive audit pass.
pub async fn status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let snapshot = state
        .run(state.timeouts.read, |sup| async move {
            sup.audit().await;
            sup.status().await
        })
        .await?;
    Ok(Json(StatusResponse {
        status: "ok",
        connection_count: snapshot.count,
        symbols: snapshot.symbols,
    }))
}

/// GET /streams/info?symbol=..&interval=..
pub async fn stream_info(
    State(state): State<AppState>,
    query: Result<Query<StreamRequest>, QueryRejection>,
) -> ApiResult<ConnectionInfo> {
    let Query(req) = query?;
    let interval = req.interval()?;
    let key = SubscriptionKey::new(&req.symbol, interval);

    let symbol = req.symbol.clone();
    let info = state
        .run(state.timeouts.read, move |sup| async move {
            sup.connection(&symbol, interval).await
        })
        .await?;

    info.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("stream {key} is not subscribed")))
}

/// POST /streams/add
pub async fn add_stream(
    State(state): State<AppState>,
    payload: JsonBody<StreamRequest>,
) -> ApiResult<MessageResponse> {
    let Json(req) = payload?;
    let interval = req.interval()?;
    let key = SubscriptionKey::new(&req.symbol, interval);

    let symbol = req.symbol.clone();
    state
        .run(state.timeouts.write, move |sup| async move {
            sup.open_stream(&symbol, interval).await
        })
        .await??;

    Ok(Json(MessageResponse::ok(format!("stream {key} is live"))))
}

/// POST /streams/remove
///
/// Removing a key that is not subscribed is not an error.
pub async fn remove_stream(
    State(state): State<AppState>,
    payload: JsonBody<StreamRequest>,
) -> ApiResult<MessageResponse> {
    let Json(req) = payload?;
    let interval = req.interval()?;
    let key = SubscriptionKey::new(&req.symbol, interval);

    let symbol = req.symbol.clone();
    let removed = state
        .run(state.timeouts.write, move |sup| async move {
            sup.close_stream(&symbol, interval).await
        })
        .await?;

    let message = if removed {
        format!("stream {key} removed")
    } else {
        format!("stream {key} was not subscribed")
    };
    Ok(Json(MessageResponse::ok(message)))
}

/// POST /symbols/add
///
/// Symbols are opened one after another. Each gets its own bound,
/// capped by what is left of the batch budget; once the budget is
/// spent the remaining symbols are reported as failed without being
/// attempted.
pub async fn add_symbols(
    State(state): State<AppState>,
    payload: JsonBody<SymbolsRequest>,
) -> ApiResult<BatchResponse> {
    let Json(req) = payload?;
    if req.symbols.is_empty() {
        return Err(ApiError::BadRequest("symbols must not be empty".into()));
    }

    let started = Instant::now();
    let interval_count = state.supervisor.config().intervals.len();
    let mut results = Vec::with_capacity(req.symbols.len());

    for symbol in &req.symbols {
        let remaining = state.timeouts.batch.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            let reason = "batch deadline reached before this symbol";
            results.push(failed_report(symbol, interval_count, reason));
            continue;
        }

        let budget = state.timeouts.per_symbol.min(remaining);
        let owned = symbol.clone();
        let outcome = state
            .run(budget, move |sup| async move { sup.open_symbol(&owned).await })
            .await;

        let report = match outcome {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => failed_report(symbol, interval_count, &e.to_string()),
            Err(e) => failed_report(symbol, interval_count, &e.to_string()),
        };
        results.push(report);
    }

    let failed_symbols: Vec<String> = results
        .iter()
        .filter(|r| r.failed_count > 0 || r.error.is_some())
        .map(|r| r.symbol.clone())
        .collect();

    let current_status = match state
        .run(state.timeouts.read, |sup| async move { sup.status().await })
        .await
    {
        Ok(snapshot) => Some(StatusResponse {
            status: "ok",
            connection_count: snapshot.count,
            symbols: snapshot.symbols,
        }),
        Err(e) => {
            log::warn!("batch status unavailable: {}", e);
            None
        }
    };

    let summary = BatchSummary {
        total_symbols: results.len(),
        success_count: results.len() - failed_symbols.len(),
        failed_count: failed_symbols.len(),
        failed_symbols,
        duration_seconds: started.elapsed().as_secs_f64(),
    };
    log::info!(
        "batch add: {} symbols, {} ok, {} failed in {:.2}s",
        summary.total_symbols,
        summary.success_count,
        summary.failed_count,
        summary.duration_seconds
    );

    Ok(Json(BatchResponse {
        status: if summary.failed_count == 0 { "ok" } else { "partial" },
        results,
        current_status,
        summary,
    }))
}

fn failed_report(symbol: &str, interval_count: usize, error: &str) -> SymbolOpenReport {
    SymbolOpenReport {
        symbol: crate::util::normalize_symbol(symbol),
        failed_count: interval_count,
        total_count: interval_count,
        error: Some(error.to_string()),
        ..Default::default()
    }
}
