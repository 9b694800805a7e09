//! Connection Manager
//!
//! Owns the single session to the appliance: dialing, authentication,
//! serialized writes and teardown. At most one dial + authenticate
//! sequence runs at a time, and a session is only handed out once its
//! authentication succeeded.

use crate::client::events::{ConnectionEvent, DisconnectReason};
use crate::client::metrics::ClientMetrics;
use crate::client::router::{Demultiplexer, PendingCalls};
use crate::client::transport::{Dialer, FrameSink};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use futures::SinkExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    /// Transport is up, authentication in progress
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
        }
    }
}

/// Mutable session state, guarded by one async mutex
pub(crate) struct SessionState {
    pub phase: ConnectionPhase,
    /// Generation of the current (or last) session
    pub session: u64,
    pub writer: Option<FrameSink>,
    pub reader: Option<JoinHandle<()>>,
    pub reader_shutdown: CancellationToken,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            session: 0,
            writer: None,
            reader: None,
            reader_shutdown: CancellationToken::new(),
        }
    }
}

/// Tear down `session` if it is still the live one. Waiters registered on
/// it are released with a lost-connection outcome. Returns the reader
/// task handle so the caller may await it.
pub(crate) fn end_session(
    state: &mut SessionState,
    session: u64,
    pending: &PendingCalls,
    events: &broadcast::Sender<ConnectionEvent>,
    host: &str,
    reason: DisconnectReason,
) -> Option<JoinHandle<()>> {
    if state.session != session || state.phase == ConnectionPhase::Disconnected {
        return None;
    }

    state.phase = ConnectionPhase::Disconnected;
    state.writer = None;
    state.reader_shutdown.cancel();
    let failed = pending.fail_session(session);

    info!(host, session, reason = %reason, failed_calls = failed, "Session ended");
    let _ = events.send(ConnectionEvent::Disconnected {
        host: host.to_string(),
        session,
        reason,
    });

    state.reader.take()
}

// =============================================================================
// Connection Manager
// =============================================================================

pub struct ConnectionManager {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    state: Arc<Mutex<SessionState>>,
    /// Serializes dial + authenticate sequences
    connect_gate: Mutex<()>,
    /// Cancelled once by `close`; a closed manager never reconnects
    shutdown: CancellationToken,
    pending: Arc<PendingCalls>,
    metrics: Arc<ClientMetrics>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        pending: Arc<PendingCalls>,
        metrics: Arc<ClientMetrics>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            config,
            dialer,
            state: Arc::new(Mutex::new(SessionState::default())),
            connect_gate: Mutex::new(()),
            shutdown: CancellationToken::new(),
            pending,
            metrics,
            events,
        }
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase
    }

    pub async fn is_connected(&self) -> bool {
        self.phase().await == ConnectionPhase::Connected
    }

    /// The live, authenticated session, if any
    async fn live_session(&self) -> Option<u64> {
        let state = self.state.lock().await;
        (state.phase == ConnectionPhase::Connected).then_some(state.session)
    }

    /// Ensure an authenticated session exists and return its id.
    ///
    /// `authenticate` runs against the freshly dialed session before any
    /// other caller can use it. Concurrent callers wait for the attempt in
    /// progress and share its session.
    pub async fn connect<F, Fut>(&self, ctx: &CancellationToken, authenticate: F) -> Result<u64>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(session) = self.live_session().await {
            return Ok(session);
        }

        let _gate = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled { method: "connect".into() }),
            gate = self.connect_gate.lock() => gate,
        };

        if let Some(session) = self.live_session().await {
            return Ok(session);
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let host = self.config.host.clone();
        debug!(host = %host, "Establishing session");

        let dial = tokio::time::timeout(self.config.timeout, self.dialer.dial(&self.config));
        let (writer, stream) = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled { method: "connect".into() }),
            dialed = dial => match dialed {
                Ok(Ok(halves)) => halves,
                Ok(Err(e @ Error::Connection { .. })) => return Err(e),
                Ok(Err(e)) => return Err(Error::connection(host, e)),
                Err(_) => {
                    return Err(Error::connection(
                        host,
                        format!("dial timed out after {:?}", self.config.timeout),
                    ))
                }
            },
        };

        let (session, handshake) = {
            let mut state = self.state.lock().await;

            // A handshake abandoned by a dropped caller may still hold the
            // transport
            let stale = state.session;
            end_session(
                &mut state,
                stale,
                &self.pending,
                &self.events,
                &host,
                DisconnectReason::HandshakeFailed,
            );

            let session = state.session + 1;
            let reader_shutdown = self.shutdown.child_token();

            state.reader = Some(
                Demultiplexer {
                    session,
                    host: host.clone(),
                    stream,
                    state: self.state.clone(),
                    pending: self.pending.clone(),
                    metrics: self.metrics.clone(),
                    events: self.events.clone(),
                    read_timeout: self.config.timeout,
                    shutdown: reader_shutdown.clone(),
                }
                .spawn(),
            );
            state.session = session;
            state.writer = Some(writer);
            state.phase = ConnectionPhase::Connecting;
            // Stops the reader, and with it the session, if this future is
            // dropped before the handshake completes
            let handshake = reader_shutdown.clone().drop_guard();
            state.reader_shutdown = reader_shutdown;
            (session, handshake)
        };

        if let Err(e) = authenticate(session).await {
            warn!(host = %host, session, error = %e, "Authentication failed");
            if e.is_auth_error() {
                let _ = self.events.send(ConnectionEvent::AuthenticationFailed {
                    host: host.clone(),
                    reason: e.to_string(),
                });
            }
            self.teardown(session, DisconnectReason::HandshakeFailed).await;
            return Err(e);
        }

        {
            let mut state = self.state.lock().await;
            if state.session != session || state.phase != ConnectionPhase::Connecting {
                return Err(Error::NotConnected);
            }
            state.phase = ConnectionPhase::Connected;
        }
        let _ = handshake.disarm();

        ClientMetrics::incr(&self.metrics.connects);
        info!(host = %host, session, "Connected to appliance");
        let _ = self.events.send(ConnectionEvent::Connected { host, session });
        Ok(session)
    }

    /// Write one text frame on `session`. Writes are serialized; a failed
    /// write ends the session.
    pub(crate) async fn write(&self, session: u64, frame: String) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.session != session || state.phase == ConnectionPhase::Disconnected {
            return Err(Error::NotConnected);
        }
        let Some(writer) = state.writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        let error = match tokio::time::timeout(self.config.timeout, writer.send(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("write failed: {}", e),
            Err(_) => format!("write timed out after {:?}", self.config.timeout),
        };

        end_session(
            &mut state,
            session,
            &self.pending,
            &self.events,
            &self.config.host,
            DisconnectReason::TransportError(error.clone()),
        );
        Err(Error::Transport(error))
    }

    async fn teardown(&self, session: u64, reason: DisconnectReason) -> Option<JoinHandle<()>> {
        let mut state = self.state.lock().await;
        end_session(
            &mut state,
            session,
            &self.pending,
            &self.events,
            &self.config.host,
            reason,
        )
    }

    /// Close the session and stop reconnecting. Safe to call repeatedly.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let session = self.state.lock().await.session;
        if let Some(reader) = self.teardown(session, DisconnectReason::Closed).await {
            let _ = reader.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{self, FakeAppliance, Reply};
    use crate::client::transport::WebSocketDialer;
    use crate::client::Client;
    use assert_matches::assert_matches;
    use futures::FutureExt;
    use serde_json::{json, Value};

    fn echo() -> FakeAppliance {
        FakeAppliance::new(|_| Reply::Result(json!(true)))
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let appliance = echo();
        let client = appliance.client();
        let ctx = CancellationToken::new();

        client.connect(&ctx).await.unwrap();
        client.connect(&ctx).await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(appliance.dial_count(), 1);
        assert_eq!(appliance.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_share_one_session() {
        let appliance = echo();
        let client = appliance.client();
        let ctx = CancellationToken::new();

        let calls = (0..10).map(|_| {
            let client = client.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { client.call::<_, bool>(&ctx, "test.ok", json!([])).await })
        });
        for result in futures::future::join_all(calls).await {
            tokio_test::assert_ok!(result.unwrap());
        }

        assert_eq!(appliance.dial_count(), 1);
        assert_eq!(appliance.auth_calls(), 1);

        // Authentication always precedes any other request on the session
        let requests = appliance.requests();
        assert_eq!(requests[0].method, crate::client::router::AUTH_METHOD);
        assert_eq!(requests.len(), 11);
    }

    #[tokio::test]
    async fn test_rejected_api_key_tears_down() {
        let appliance = echo();
        let config = ClientConfig {
            api_key: "1-wrong".into(),
            ..testing::config()
        };
        let client = appliance.client_with(config);
        let mut events = client.subscribe();
        let ctx = CancellationToken::new();

        let err = client.connect(&ctx).await.unwrap_err();
        assert_matches!(err, Error::Authentication(ref msg) if msg.contains("invalid API key"));
        assert!(err.is_auth_error());
        assert!(!client.is_connected().await);
        assert_eq!(client.phase().await, ConnectionPhase::Disconnected);

        assert_matches!(
            events.recv().await,
            Ok(ConnectionEvent::AuthenticationFailed { .. })
        );
        assert_matches!(
            events.recv().await,
            Ok(ConnectionEvent::Disconnected { reason: DisconnectReason::HandshakeFailed, .. })
        );
    }

    #[tokio::test]
    async fn test_refused_dial_reports_diagnostic() {
        let appliance = echo();
        appliance.dialer().set_refuse(true);
        let client = appliance.client();
        let ctx = CancellationToken::new();

        let err = client
            .call::<_, Value>(&ctx, "system.info", json!([]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Connection { .. });
        let text = err.to_string();
        assert!(text.contains("connection refused"));
        assert!(text.contains("TRUENAS_HOST"));
        assert!(err.is_transient());
        assert_eq!(client.metrics().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_over_websocket() {
        let config = ClientConfig::new("127.0.0.1:1", testing::API_KEY)
            .with_verify_ssl(false)
            .with_timeout(std::time::Duration::from_secs(5));
        let client = Client::with_dialer(config, Arc::new(WebSocketDialer)).unwrap();
        let ctx = CancellationToken::new();

        let err = client.connect(&ctx).await.unwrap_err();
        assert_matches!(err, Error::Connection { ref host, .. } if host == "127.0.0.1:1");
        assert!(err
            .to_string()
            .contains("curl -k https://127.0.0.1:1/api/current"));
    }

    #[tokio::test]
    async fn test_dropped_handshake_releases_transport() {
        let appliance = echo();
        let client = appliance.client();
        let mut events = client.subscribe();
        let ctx = CancellationToken::new();

        // Poll once so the transport is installed and the handshake is in
        // flight, then give up on it
        assert!(client.connect(&ctx).now_or_never().is_none());

        assert_matches!(
            events.recv().await,
            Ok(ConnectionEvent::Disconnected { session: 1, .. })
        );
        assert_eq!(client.phase().await, ConnectionPhase::Disconnected);
        assert_eq!(client.pending_calls(), 0);

        client.connect(&ctx).await.unwrap();
        assert_eq!(appliance.dial_count(), 2);
        assert_matches!(
            events.recv().await,
            Ok(ConnectionEvent::Connected { session: 2, .. })
        );
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_close_is_final_and_repeatable() {
        let appliance = echo();
        let client = appliance.client();
        let ctx = CancellationToken::new();
        client.connect(&ctx).await.unwrap();

        client.close().await;
        client.close().await;
        assert!(!client.is_connected().await);
        assert_matches!(client.connect(&ctx).await, Err(Error::Closed));
        assert_eq!(appliance.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let appliance = echo();
        let client = appliance.client();
        let ctx = CancellationToken::new();
        ctx.cancel();

        // Dialing and the handshake race the caller's token
        let result = client.call::<_, Value>(&ctx, "test.ok", json!([])).await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
    }
}
