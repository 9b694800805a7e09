//! Client
//!
//! Public entry point of the engine. A [`Client`] is cheap to clone and
//! safe to share across tasks; every clone drives the same session.
//!
//! ```text
//!   caller ──► Client::{query,get_instance,create,...}
//!                 │
//!                 ▼
//!            CallRouter ──register──► PendingCalls ◄──deliver── Demultiplexer
//!                 │                                                  ▲
//!                 ▼                                                  │
//!          ConnectionManager ──write──► FrameSink      FrameStream ──┘
//! ```

pub mod connection;
pub mod events;
mod jobs;
pub mod metrics;
pub mod router;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::ConnectionPhase;
pub use events::{ConnectionEvent, DisconnectReason};
pub use jobs::{Job, JobProgress, JobState};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::{self, QueryParams};
use connection::ConnectionManager;
use router::{CallRouter, PendingCalls};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transport::{Dialer, WebSocketDialer};

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// Client for the appliance's JSON-RPC WebSocket API
#[derive(Clone)]
pub struct Client {
    router: Arc<CallRouter>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", self.config())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client that dials the appliance over TLS WebSocket.
    /// No connection is made until the first call.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_dialer(config, Arc::new(WebSocketDialer))
    }

    /// Create a client over a custom transport
    pub fn with_dialer(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        config.validate()?;

        let pending = Arc::new(PendingCalls::new());
        let metrics = Arc::new(ClientMetrics::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let connection = ConnectionManager::new(
            config.clone(),
            dialer,
            pending.clone(),
            metrics.clone(),
            events.clone(),
        );
        let router = CallRouter::new(config, connection, pending, metrics, events);

        Ok(Self {
            router: Arc::new(router),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.router.config()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Dial and authenticate now instead of on first use
    pub async fn connect(&self, ctx: &CancellationToken) -> Result<()> {
        self.router.ensure_connected(ctx).await.map(|_| ())
    }

    /// Tear down the session. The client cannot be used afterwards.
    pub async fn close(&self) {
        self.router.close().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.router.connection().is_connected().await
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.router.connection().phase().await
    }

    /// Subscribe to lifecycle and timeout events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.router.subscribe()
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.router.metrics().snapshot()
    }

    /// Calls currently waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.router.pending().len()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call an arbitrary method. `params` is sent as given; pass a JSON
    /// array for positional arguments, or `()` for none.
    pub async fn call<P, R>(&self, ctx: &CancellationToken, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.router.call(ctx, method, params).await
    }

    /// `{kind}.query` with optional filters and options
    pub async fn query<R>(
        &self,
        ctx: &CancellationToken,
        kind: &str,
        params: Option<&QueryParams>,
    ) -> Result<R>
    where
        R: DeserializeOwned,
    {
        let args = params.map(QueryParams::to_args).unwrap_or_else(|| json!([]));
        self.call(ctx, &protocol::method(kind, "query"), args).await
    }

    /// `{kind}.get_instance`
    pub async fn get_instance<I, R>(&self, ctx: &CancellationToken, kind: &str, id: I) -> Result<R>
    where
        I: Serialize,
        R: DeserializeOwned,
    {
        let args = [serde_json::to_value(id)?];
        self.call(ctx, &protocol::method(kind, "get_instance"), args)
            .await
    }

    /// `{kind}.create`
    pub async fn create<D, R>(&self, ctx: &CancellationToken, kind: &str, data: D) -> Result<R>
    where
        D: Serialize,
        R: DeserializeOwned,
    {
        let args = [serde_json::to_value(data)?];
        self.call(ctx, &protocol::method(kind, "create"), args)
            .await
    }

    /// `{kind}.update`
    pub async fn update<I, D, R>(
        &self,
        ctx: &CancellationToken,
        kind: &str,
        id: I,
        data: D,
    ) -> Result<R>
    where
        I: Serialize,
        D: Serialize,
        R: DeserializeOwned,
    {
        let args = [serde_json::to_value(id)?, serde_json::to_value(data)?];
        self.call(ctx, &protocol::method(kind, "update"), args)
            .await
    }

    /// `{kind}.delete`; the result payload is discarded
    pub async fn delete<I>(&self, ctx: &CancellationToken, kind: &str, id: I) -> Result<()>
    where
        I: Serialize,
    {
        let method = protocol::method(kind, "delete");
        let args = [serde_json::to_value(id)?];
        let _: IgnoredAny = self.call(ctx, &method, args).await?;
        debug!(method = %method, "Deleted");
        Ok(())
    }

    /// `{kind}.delete` with an options object
    pub async fn delete_with_options<I, O>(
        &self,
        ctx: &CancellationToken,
        kind: &str,
        id: I,
        options: O,
    ) -> Result<()>
    where
        I: Serialize,
        O: Serialize,
    {
        let method = protocol::method(kind, "delete");
        let args = [serde_json::to_value(id)?, serde_json::to_value(options)?];
        let _: IgnoredAny = self.call(ctx, &method, args).await?;
        debug!(method = %method, "Deleted");
        Ok(())
    }
}
