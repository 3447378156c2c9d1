use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use anyhow::{anyhow, bail};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::schema::{Interval, SubscriptionKey};

use super::adapter::{KlineStream, StreamClient, StreamEvents, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type AckSender = oneshot::Sender<Result<(), String>>;

/// Binance spot kline WebSocket client.
///
/// Binance Spot WS:
/// https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams
///
/// One transport connection is opened per subscription key, so a
/// broken socket only ever takes down one (symbol, interval) pair.
pub struct BinanceClient {
    ws_url: String,
}

impl BinanceClient {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into() }
    }
}

#[async_trait::async_trait]
impl StreamClient for BinanceClient {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>> {
        let (ws, _) = connect_async(self.ws_url.as_str()).await?;
        let (write, read) = ws.split();

        let shared = Arc::new(Shared {
            writer: Mutex::new(write),
            routes: StdMutex::new(Routes::default()),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(u64::from(rand::random::<u32>())),
        });

        tokio::spawn(read_loop(read, shared.clone()));

        Ok(Arc::new(BinanceConnection {
            shared,
            closed: AtomicBool::new(false),
        }))
    }
}

// ------------------------------------------------------------
// Shared connection state
// ------------------------------------------------------------
//
// Owned jointly by the transport, its streams and the reader task.
// The reader only holds it until the cancel token fires or the
// socket fails.
//
struct Shared {
    writer: Mutex<WsSink>,
    routes: StdMutex<Routes>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_json(&self, payload: Value) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(payload.to_string().into())).await?;
        Ok(())
    }
}

/// Callback routing table of one connection.
#[derive(Default)]
struct Routes {
    error_handler: Option<Arc<dyn StreamEvents>>,
    streams: HashMap<String, Arc<dyn StreamEvents>>,
    pending: HashMap<u64, AckSender>,
}

pub struct BinanceConnection {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Transport for BinanceConnection {
    fn set_error_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()> {
        if self.shared.cancel.is_cancelled() {
            bail!("connection already closed");
        }
        let mut routes = self.shared.routes();
        if routes.error_handler.is_some() {
            bail!("error handler already wired");
        }
        routes.error_handler = Some(handler);
        Ok(())
    }

    async fn subscribe(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> anyhow::Result<Arc<dyn KlineStream>> {
        let name = SubscriptionKey::new(symbol, interval).stream_name();
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();

        self.shared.routes().pending.insert(id, tx);

        let request = json!({
            "method": "SUBSCRIBE",
            "params": [name],
            "id": id
        });
        if let Err(e) = self.shared.send_json(request).await {
            self.shared.routes().pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(Arc::new(BinanceStream {
                name,
                shared: self.shared.clone(),
                closed: AtomicBool::new(false),
            })),
            Ok(Err(reason)) => Err(anyhow!("subscribe {} rejected: {}", name, reason)),
            Err(_) => Err(anyhow!("connection closed before {} was acknowledged", name)),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Cancel first so the reader does not report our own close
        // as a transport error.
        self.shared.cancel.cancel();

        let mut writer = self.shared.writer.lock().await;
        match writer.close().await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BinanceConnection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

pub struct BinanceStream {
    name: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl KlineStream for BinanceStream {
    fn set_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("stream {} already closed", self.name);
        }
        self.shared.routes().streams.insert(self.name.clone(), handler);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.routes().streams.remove(&self.name);

        if self.shared.cancel.is_cancelled() {
            return Ok(());
        }
        // Fire and forget: the ack is not routed anywhere.
        self.shared
            .send_json(json!({
                "method": "UNSUBSCRIBE",
                "params": [self.name],
                "id": self.shared.next_id()
            }))
            .await
    }
}

// ------------------------------------------------------------
// Reader task
// ------------------------------------------------------------
//
// - Routes acks to pending subscribe calls
// - Delivers kline frames to the matching stream callback
// - Reports the first read failure / EOF to the transport error
//   callback, exactly once
//
async fn read_loop(mut read: SplitStream<WsStream>, shared: Arc<Shared>) {
    let failure = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch(&shared.routes, text.as_str()),

                Some(Ok(Message::Close(_))) | None => {
                    break "connection closed by upstream".to_string();
                }

                // Ping / pong / binary frames carry no kline data
                Some(Ok(_)) => {}

                Some(Err(e)) => break e.to_string(),
            }
        }
    };

    if shared.cancel.is_cancelled() {
        return;
    }
    shared.cancel.cancel();

    let handler = {
        let mut routes = shared.routes();
        for (_, ack) in routes.pending.drain() {
            let _ = ack.send(Err(failure.clone()));
        }
        routes.error_handler.take()
    };

    log::debug!("upstream reader stopped: {}", failure);
    if let Some(handler) = handler {
        handler.on_error(&failure);
    }
}

/// Routes one text frame. Callbacks are invoked after the routing
/// lock has been released.
fn dispatch(routes: &StdMutex<Routes>, raw: &str) {
    let mut routes_guard = routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if raw.trim().is_empty() {
        let targets: Vec<_> = routes_guard.streams.values().cloned().collect();
        drop(routes_guard);
        for target in targets {
            target.on_message(None);
        }
        return;
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            drop(routes_guard);
            log::warn!("upstream sent non-JSON frame: {}", e);
            return;
        }
    };

    // Request / response frame: { "result": null, "id": 1 } or
    // { "error": {...}, "id": 1 }
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some(ack) = routes_guard.pending.remove(&id) {
            let outcome = match value.get("error") {
                Some(err) => Err(err.to_string()),
                None => Ok(()),
            };
            let _ = ack.send(outcome);
        }
        return;
    }

    if let Some(err) = value.get("error") {
        let targets: Vec<_> = routes_guard.streams.values().cloned().collect();
        drop(routes_guard);
        let reason = err.to_string();
        for target in targets {
            target.on_error(&reason);
        }
        return;
    }

    let target = stream_name_of(&value).and_then(|name| routes_guard.streams.get(&name).cloned());
    drop(routes_guard);

    if let Some(target) = target {
        target.on_message(Some(raw));
    }
}

/// Resolves the stream a frame belongs to, for both the raw
/// (`{"e":"kline",...}`) and combined (`{"stream":..,"data":..}`)
/// payload forms.
fn stream_name_of(value: &Value) -> Option<String> {
    if let Some(stream) = value.get("stream").and_then(Value::as_str) {
        return Some(stream.to_string());
    }
    let symbol = value.get("s")?.as_str()?;
    let interval = value.get("k")?.get("i")?.as_str()?;
    Some(format!("{}@kline_{}", symbol.to_lowercase(), interval))
}
