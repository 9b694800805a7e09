//! Call Router
//!
//! Correlates outbound requests with inbound responses over the shared
//! session. Each call registers a one-shot waiter under a fresh id; a
//! single demultiplexing task per session reads frames and hands each
//! response to the waiter with the matching id. Arrival order is
//! irrelevant.

use crate::client::connection::{end_session, ConnectionManager, SessionState};
use crate::client::events::{ConnectionEvent, DisconnectReason};
use crate::client::metrics::ClientMetrics;
use crate::client::transport::{Frame, FrameStream};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::codes;
use crate::protocol::message::{Request, Response};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Method exchanging the API key for a session
pub const AUTH_METHOD: &str = "auth.login_with_api_key";

// =============================================================================
// Routing Table
// =============================================================================

struct Waiter {
    session: u64,
    tx: oneshot::Sender<Response>,
}

/// Outcome of handing a response to the routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiter received it
    Delivered,
    /// No waiter was registered, or it had already given up
    Unclaimed,
}

/// In-flight calls keyed by correlation id
#[derive(Default)]
pub struct PendingCalls {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id` on `session`
    pub fn register(&self, id: u64, session: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, Waiter { session, tx });
        rx
    }

    /// Remove the waiter for `id`; returns whether one was present
    pub fn unregister(&self, id: u64) -> bool {
        self.waiters.lock().remove(&id).is_some()
    }

    /// Hand `response` to the waiter for `id` without blocking
    pub fn deliver(&self, id: u64, response: Response) -> Delivery {
        let waiter = self.waiters.lock().remove(&id);
        match waiter.map(|w| w.tx.send(response)) {
            Some(Ok(())) => Delivery::Delivered,
            _ => Delivery::Unclaimed,
        }
    }

    /// Drop every waiter registered on `session`; their callers observe a
    /// lost connection. Returns how many were dropped.
    pub fn fail_session(&self, session: u64) -> usize {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|_, w| w.session != session);
        before - waiters.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a routing-table entry when the call leaves scope, whatever the
/// exit path.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingCalls,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingCalls, id: u64) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.unregister(self.id);
    }
}

// =============================================================================
// Demultiplexer
// =============================================================================

/// Reader task for one session
pub(crate) struct Demultiplexer {
    pub session: u64,
    pub host: String,
    pub stream: FrameStream,
    pub state: Arc<tokio::sync::Mutex<SessionState>>,
    pub pending: Arc<PendingCalls>,
    pub metrics: Arc<ClientMetrics>,
    pub events: broadcast::Sender<ConnectionEvent>,
    /// Idle read deadline; expiry is a liveness probe, not a failure
    pub read_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl Demultiplexer {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(session = self.session, "Demultiplexer started");

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break DisconnectReason::Closed,
                next = tokio::time::timeout(self.read_timeout, self.stream.next()) => next,
            };

            match next {
                Err(_) => {
                    trace!(session = self.session, "Read deadline elapsed, refreshing");
                }
                Ok(None) => break DisconnectReason::RemoteClosed(None),
                Ok(Some(Ok(Frame::Closed(reason)))) => break DisconnectReason::RemoteClosed(reason),
                Ok(Some(Ok(Frame::Control))) => {}
                Ok(Some(Ok(Frame::Text(text)))) => self.route(&text),
                Ok(Some(Err(Error::Protocol(msg)))) => {
                    warn!(session = self.session, error = %msg, "Skipping undecodable frame");
                }
                Ok(Some(Err(e))) => break DisconnectReason::TransportError(e.to_string()),
            }
        };

        let mut state = self.state.lock().await;
        end_session(
            &mut state,
            self.session,
            &self.pending,
            &self.events,
            &self.host,
            reason,
        );
        debug!(session = self.session, "Demultiplexer stopped");
    }

    fn route(&self, text: &str) {
        let response = match Response::from_json(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(session = self.session, error = %e, "Dropping malformed frame");
                ClientMetrics::incr(&self.metrics.frames_dropped);
                return;
            }
        };

        let Some(id) = response.id else {
            if let Some(err) = &response.error {
                warn!(
                    session = self.session,
                    code = err.code,
                    kind = codes::name(err.code),
                    message = %err.message,
                    "Appliance reported an error without a request id"
                );
            } else {
                debug!(session = self.session, "Ignoring frame without a request id");
            }
            ClientMetrics::incr(&self.metrics.frames_dropped);
            return;
        };

        match self.pending.deliver(id, response) {
            Delivery::Delivered => trace!(session = self.session, id, "Delivered response"),
            Delivery::Unclaimed => {
                debug!(session = self.session, id, "No waiter for response, dropping");
                ClientMetrics::incr(&self.metrics.frames_dropped);
            }
        }
    }
}

// =============================================================================
// Call Router
// =============================================================================

/// Issues calls over the managed connection
pub struct CallRouter {
    config: ClientConfig,
    connection: ConnectionManager,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    metrics: Arc<ClientMetrics>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl CallRouter {
    pub(crate) fn new(
        config: ClientConfig,
        connection: ConnectionManager,
        pending: Arc<PendingCalls>,
        metrics: Arc<ClientMetrics>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            config,
            connection,
            pending,
            next_id: AtomicU64::new(0),
            metrics,
            events,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Connect and authenticate unless a session is already live
    pub async fn ensure_connected(&self, ctx: &CancellationToken) -> Result<u64> {
        self.connection
            .connect(ctx, |session| self.authenticate(ctx, session))
            .await
    }

    async fn authenticate(&self, ctx: &CancellationToken, session: u64) -> Result<()> {
        let params = json!([self.config.api_key]);
        match self.dispatch(ctx, session, AUTH_METHOD, Some(params)).await {
            Ok(Value::Bool(true)) => Ok(()),
            Ok(_) => Err(Error::Authentication("invalid API key".into())),
            Err(e @ Error::Cancelled { .. }) => Err(e),
            Err(e) => Err(Error::Authentication(e.to_string())),
        }
    }

    /// Call `method` and decode its result into `R`
    pub async fn call<P, R>(&self, ctx: &CancellationToken, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            value => Some(value),
        };
        let result = self.call_value(ctx, method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Call `method` and return the raw result payload
    pub async fn call_value(
        &self,
        ctx: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        ClientMetrics::incr(&self.metrics.calls_started);

        let result = match self.ensure_connected(ctx).await {
            Ok(session) => self.dispatch(ctx, session, method, params).await,
            Err(e) => Err(e),
        };

        let counter = match &result {
            Ok(_) => &self.metrics.calls_succeeded,
            Err(Error::Timeout { .. }) => &self.metrics.calls_timed_out,
            Err(Error::Cancelled { .. }) => &self.metrics.calls_cancelled,
            Err(_) => &self.metrics.calls_failed,
        };
        ClientMetrics::incr(counter);
        result
    }

    /// Send one request on `session` and wait for its response
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        session: u64,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let rx = self.pending.register(id, session);
        let _guard = PendingGuard::new(&self.pending, id);

        let frame = Request::new(id, method, params).to_json()?;
        debug!(id, method, "Sending request");
        self.connection.write(session, frame).await?;

        let timeout = self.config.timeout;
        let response = tokio::select! {
            response = rx => response.map_err(|_| Error::ConnectionLost {
                method: method.to_string(),
            })?,
            _ = ctx.cancelled() => {
                debug!(id, method, "Request cancelled by caller");
                return Err(Error::Cancelled { method: method.to_string() });
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(id, method, ?timeout, "Request timed out");
                let _ = self.events.send(ConnectionEvent::CallTimedOut {
                    method: method.to_string(),
                    id,
                    after: timeout,
                });
                return Err(Error::Timeout { method: method.to_string(), after: timeout });
            }
        };

        if let Some(err) = response.error {
            debug!(id, method, code = err.code, "Appliance returned an error");
            return Err(Error::Api(err.into()));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Close the session for good
    pub async fn close(&self) {
        info!(host = %self.config.host, "Closing client");
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{self, Reply};
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_pending_register_deliver() {
        let table = PendingCalls::new();
        let mut rx = table.register(1, 1);
        assert_eq!(table.len(), 1);

        let delivery = table.deliver(1, Response::success(1, json!(true)));
        assert_eq!(delivery, Delivery::Delivered);
        assert!(table.is_empty());
        assert_eq!(rx.try_recv().unwrap().result, Some(json!(true)));

        // A second response for the same id has nowhere to go
        assert_eq!(table.deliver(1, Response::success(1, json!(true))), Delivery::Unclaimed);
    }

    #[test]
    fn test_deliver_to_abandoned_waiter() {
        let table = PendingCalls::new();
        let rx = table.register(5, 1);
        drop(rx);
        assert_eq!(table.deliver(5, Response::success(5, json!(1))), Delivery::Unclaimed);
        assert!(table.is_empty());
    }

    #[test]
    fn test_guard_unregisters() {
        let table = PendingCalls::new();
        let _rx = table.register(7, 1);
        {
            let _guard = PendingGuard::new(&table, 7);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_fail_session_only_drops_that_session() {
        let table = PendingCalls::new();
        let mut old = table.register(1, 1);
        let _new = table.register(2, 2);

        assert_eq!(table.fail_session(1), 1);
        assert_eq!(table.len(), 1);
        assert!(old.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_pair_by_id() {
        let appliance = testing::FakeAppliance::new(|req| {
            Reply::Result(json!({ "echo": req.params.clone() }))
        })
        .reorder_batch(8);
        let client = appliance.client();
        let ctx = CancellationToken::new();
        client.connect(&ctx).await.unwrap();

        let calls = (0..8).map(|i| {
            let client = client.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let reply: Value = client.call(&ctx, "test.echo", json!([i])).await.unwrap();
                (i, reply)
            })
        });

        for handle in futures::future::join_all(calls).await {
            let (i, reply) = handle.unwrap();
            assert_eq!(reply, json!({ "echo": [i] }));
        }
        assert_eq!(client.pending_calls(), 0);
        assert!(appliance.replied_out_of_order());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_calls_leave_no_entries() {
        let appliance = testing::FakeAppliance::new(|_| Reply::Silent);
        let client = appliance.client();
        let root = CancellationToken::new();
        client.connect(&root).await.unwrap();

        let mut handles = Vec::new();
        let mut tokens = Vec::new();
        for i in 0..16 {
            let ctx = CancellationToken::new();
            tokens.push(ctx.clone());
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.call::<_, Value>(&ctx, "test.never", json!([i])).await
            }));
        }

        // Let every call register and write its frame
        while client.metrics().calls_started < 16 || client.pending_calls() < 16 {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        for token in &tokens {
            token.cancel();
        }
        for handle in handles {
            assert_matches!(handle.await.unwrap(), Err(Error::Cancelled { .. }));
        }

        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(client.metrics().calls_cancelled, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let appliance = testing::FakeAppliance::new(|_| Reply::Silent);
        let client = appliance.client();
        let ctx = CancellationToken::new();
        client.connect(&ctx).await.unwrap();
        let mut events = client.subscribe();

        let started = tokio::time::Instant::now();
        let result = client.call::<_, Value>(&ctx, "pool.query", json!([])).await;
        let elapsed = started.elapsed();

        assert_matches!(result, Err(Error::Timeout { ref method, after }) if method == "pool.query" && after == testing::TIMEOUT);
        assert!(elapsed >= testing::TIMEOUT);
        assert!(elapsed < testing::TIMEOUT + Duration::from_millis(50));
        assert_eq!(client.pending_calls(), 0);
        assert_matches!(events.recv().await, Ok(ConnectionEvent::CallTimedOut { .. }));
    }

    #[tokio::test]
    async fn test_wire_error_is_classified() {
        let appliance = testing::FakeAppliance::new(|_| {
            Reply::Error(
                crate::protocol::WireError::new(codes::INVALID_PARAMS, "Invalid params")
                    .with_data(json!({"errname": "InstanceNotFound"})),
            )
        });
        let client = appliance.client();
        let ctx = CancellationToken::new();

        let err = client
            .get_instance::<_, Value>(&ctx, "pool", 99)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(client.metrics().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_remote_close_fails_in_flight_calls() {
        let appliance = testing::FakeAppliance::new(|req| match req.method.as_str() {
            "test.hang" => Reply::Close,
            _ => Reply::Result(json!(true)),
        });
        let client = appliance.client();
        let ctx = CancellationToken::new();

        let err = client
            .call::<_, Value>(&ctx, "test.hang", json!([]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConnectionLost { .. });
        assert!(!client.is_connected().await);

        // The next call dials and authenticates again
        let ok: bool = client.call(&ctx, "test.ok", json!([])).await.unwrap();
        assert!(ok);
        assert_eq!(appliance.dial_count(), 2);
        assert_eq!(appliance.auth_calls(), 2);
    }
}
