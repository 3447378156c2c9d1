use std::sync::Arc;

use crate::schema::Interval;

/// Callback capability the upstream client library delivers into.
///
/// The supervisor implements this once per subscription key. The
/// implementation must return immediately: it is called on the
/// transport's delivery path and anything slow belongs in a task
/// it schedules.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - The same instance is shared between the transport reader and
///   the stream it belongs to
///
pub trait StreamEvents: Send + Sync {
    /// A raw frame for this stream. `None` when the library hands
    /// over an empty delivery.
    fn on_message(&self, raw: Option<&str>);

    /// Any transport- or stream-level failure.
    fn on_error(&self, error: &str);
}

/// StreamClient is the abstraction layer between:
/// - The supervisor's open protocol
/// - A concrete upstream streaming library
///
/// The supervisor treats it as a black box offering
/// connect / subscribe / on-message / close primitives.
///
/// CONTRACT:
/// - One `connect()` yields one independent transport connection
/// - Created at most once per process and shared read-only
///
#[async_trait::async_trait]
pub trait StreamClient: Send + Sync {
    /// Canonical upstream name, used for logging.
    fn name(&self) -> &'static str;

    /// Opens a new transport connection.
    ///
    /// The caller bounds this with its own timeout; dropping the
    /// future must leave nothing running.
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>>;
}

/// A single live transport connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Wires the transport-level error callback.
    ///
    /// May be called once per connection. The callback fires at most
    /// once, when the connection fails or is closed by the peer.
    fn set_error_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()>;

    /// Requests the candle stream for `symbol` / `interval`.
    async fn subscribe(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> anyhow::Result<Arc<dyn KlineStream>>;

    /// Closes the connection. Must be idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A subscribed candle stream living on a transport connection.
#[async_trait::async_trait]
pub trait KlineStream: Send + Sync {
    /// Wires both message and stream-level error callbacks.
    fn set_handler(&self, handler: Arc<dyn StreamEvents>) -> anyhow::Result<()>;

    /// Unsubscribes the stream. Must be idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}
