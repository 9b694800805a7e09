//! Duplex Transport
//!
//! The engine talks to the appliance through a pair of boxed halves: a
//! sink accepting outbound text frames and a stream yielding inbound
//! frames. [`WebSocketDialer`] produces them from a TLS WebSocket;
//! [`memory::MemoryDialer`] produces an in-process pair.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::pin::Pin;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::Connector;
use tracing::{debug, warn};

// =============================================================================
// Frames
// =============================================================================

/// An inbound frame, reduced to what the demultiplexer cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A message payload
    Text(String),
    /// The peer closed the session, with its reason if any
    Closed(Option<String>),
    /// Ping/pong or other control traffic
    Control,
}

/// Outbound half
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Establishes a fresh duplex transport to the appliance
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, config: &ClientConfig) -> Result<(FrameSink, FrameStream)>;
}

// =============================================================================
// WebSocket Dialer
// =============================================================================

/// Dials `wss://{host}/api/current` with rustls
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, config: &ClientConfig) -> Result<(FrameSink, FrameStream)> {
        let url = config.url();
        let connector = Connector::Rustls(Arc::new(tls_config(config.verify_ssl)?));

        debug!(url = %url, verify_ssl = config.verify_ssl, "Dialing appliance");

        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, true, Some(connector))
                .await?;
        let (sink, stream) = ws.split();

        let sink = sink.with(|text: String| {
            futures::future::ready(Ok::<_, Error>(Message::Text(text.into())))
        });
        let stream = stream.map(frame_from_message);

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn frame_from_message(msg: std::result::Result<Message, tungstenite::Error>) -> Result<Frame> {
    match msg {
        Ok(Message::Text(text)) => Ok(Frame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec())
            .map(Frame::Text)
            .map_err(|e| Error::Protocol(format!("binary frame is not UTF-8: {}", e))),
        Ok(Message::Close(frame)) => Ok(Frame::Closed(frame.map(|f| f.reason.as_str().to_owned()))),
        Ok(_) => Ok(Frame::Control),
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
            Ok(Frame::Closed(None))
        }
        Err(e) => Err(Error::from(e)),
    }
}

// =============================================================================
// TLS
// =============================================================================

fn tls_config(verify_ssl: bool) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS setup failed: {}", e)))?;

    if !verify_ssl {
        warn!("TLS certificate verification is disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!(error = %err, "Skipping unreadable native certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded native root certificates");

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Verifier used when the caller opts out of certificate checks.
/// Handshake signatures are still checked so the session keys are sound.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// =============================================================================
// In-Memory Transport
// =============================================================================

pub mod memory {
    //! In-process transport pair, used by tests and benchmarks to stand in
    //! for the appliance.

    use super::{Dialer, Frame, FrameSink, FrameStream};
    use crate::config::ClientConfig;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Appliance side of one dialed session
    pub struct MemorySession {
        /// Text frames written by the client
        pub requests: mpsc::UnboundedReceiver<String>,
        /// Frames delivered to the client's reader
        pub replies: mpsc::UnboundedSender<Result<Frame>>,
    }

    impl MemorySession {
        /// Send a text frame to the client
        pub fn reply(&self, text: impl Into<String>) -> bool {
            self.replies.unbounded_send(Ok(Frame::Text(text.into()))).is_ok()
        }

        /// Send a closure frame to the client
        pub fn close(&self, reason: Option<&str>) -> bool {
            self.replies
                .unbounded_send(Ok(Frame::Closed(reason.map(str::to_owned))))
                .is_ok()
        }
    }

    /// Dialer handing each new session to the appliance side
    pub struct MemoryDialer {
        sessions: mpsc::UnboundedSender<MemorySession>,
        dials: AtomicUsize,
        refuse: AtomicBool,
    }

    impl MemoryDialer {
        /// Create a dialer and the receiver of dialed sessions
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySession>) {
            let (tx, rx) = mpsc::unbounded();
            let dialer = Self {
                sessions: tx,
                dials: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
            };
            (dialer, rx)
        }

        /// Number of dial attempts so far
        pub fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        /// Make subsequent dials fail as if the host were unreachable
        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Dialer for MemoryDialer {
        async fn dial(&self, config: &ClientConfig) -> Result<(FrameSink, FrameStream)> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::connection(
                    config.host.clone(),
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
                ));
            }

            let (request_tx, request_rx) = mpsc::unbounded::<String>();
            let (reply_tx, reply_rx) = mpsc::unbounded::<Result<Frame>>();

            self.sessions
                .unbounded_send(MemorySession {
                    requests: request_rx,
                    replies: reply_tx,
                })
                .map_err(|_| Error::connection(config.host.clone(), "appliance is gone"))?;

            let sink = request_tx.sink_map_err(|e| Error::Transport(e.to_string()));
            Ok((Box::pin(sink), Box::pin(reply_rx.fuse())))
        }
    }
}
