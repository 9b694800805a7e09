//! TrueNAS RPC Engine
//!
//! A client engine for the TrueNAS JSON-RPC 2.0 API served over a
//! persistent TLS WebSocket. Many tasks share one authenticated session;
//! responses are paired with calls by id, whatever order they arrive in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         High-Level Call Surface                      │
//! │   query · get_instance · create · update · delete · wait_for_job     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐            ┌────────────────────────────┐  │
//! │  │     Call Router      │  register  │     Routing Table          │  │
//! │  │  (timeout / cancel)  │───────────►│  id → one-shot waiter      │  │
//! │  └──────────┬───────────┘            └─────────────▲──────────────┘  │
//! │             │ write                                │ deliver         │
//! │  ┌──────────▼───────────┐            ┌─────────────┴──────────────┐  │
//! │  │  Connection Manager  │            │      Demultiplexer         │  │
//! │  │  (dial · auth · tls) │            │  (one reader per session)  │  │
//! │  └──────────┬───────────┘            └─────────────▲──────────────┘  │
//! ├─────────────┼──────────────────────────────────────┼────────────────┤
//! │             ▼            wss://{host}/api/current  │                 │
//! │                        TrueNAS appliance ──────────┘                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`client`]: session management, call routing, job polling
//! - [`protocol`]: wire envelopes, error codes, query parameters
//! - [`config`]: client configuration
//! - [`error`]: error types and classification

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use client::{
    Client, ClientMetricsSnapshot, ConnectionEvent, ConnectionPhase, DisconnectReason, Job,
    JobProgress, JobState,
};

pub use config::ClientConfig;

pub use error::{ApiError, ApiErrorKind, Error, Result};

pub use protocol::QueryParams;

pub use tokio_util::sync::CancellationToken;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
