//! Error types for the TrueNAS RPC engine
//!
//! Provides the crate-wide error taxonomy: connection failures, protocol
//! faults, classified application errors, local timeouts, cancellation and
//! job outcomes.

use crate::protocol::codes;
use crate::protocol::message::WireError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed source error carried by connection failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Connection Errors
    // =========================================================================
    #[error("{}", connection_diagnostic(.host, .source))]
    Connection {
        host: String,
        #[source]
        source: BoxError,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not connected to the appliance")]
    NotConnected,

    #[error("client has been closed")]
    Closed,

    #[error("connection lost while waiting for a response to {method}")]
    ConnectionLost { method: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Application Errors
    // =========================================================================
    #[error(transparent)]
    Api(#[from] ApiError),

    // =========================================================================
    // Local Timeouts & Cancellation
    // =========================================================================
    #[error("request {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("request {method} cancelled by caller")]
    Cancelled { method: String },

    // =========================================================================
    // Job Errors
    // =========================================================================
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: i64, message: String },

    #[error("job {job_id} was aborted")]
    JobAborted { job_id: i64 },

    #[error("timeout waiting for job {job_id} to complete after {after:?}")]
    JobTimeout { job_id: i64, after: Duration },

    #[error("job {job_id} not found")]
    JobNotFound { job_id: i64 },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("configuration file error: {0}")]
    ConfigurationFile(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a connection failure for `host`
    pub fn connection(host: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Connection {
            host: host.into(),
            source: source.into(),
        }
    }

    /// The classified remote error, if this is one
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the remote object does not exist
    pub fn is_not_found(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_not_found)
    }

    /// Whether the call was rejected for authentication or authorization
    pub fn is_auth_error(&self) -> bool {
        match self {
            Error::Authentication(_) => true,
            Error::Api(e) => e.is_auth_error(),
            _ => false,
        }
    }

    /// Whether the appliance rejected the payload as invalid
    pub fn is_validation_error(&self) -> bool {
        self.api_error().is_some_and(ApiError::is_validation_error)
    }

    /// Check if this error is transient (a later call may succeed)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::NotConnected
                | Error::ConnectionLost { .. }
                | Error::Transport(_)
                | Error::WebSocket(_)
                | Error::Timeout { .. }
        )
    }
}

// =============================================================================
// Classified API Error
// =============================================================================

/// Kind of a remote error, as decided by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    Auth,
    Validation,
    Generic,
}

/// An error returned by the appliance in place of a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Wire error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Raw text of the optional detail payload
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Classify this error
    pub fn kind(&self) -> ApiErrorKind {
        codes::classify(self.code, self.details.as_deref())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ApiErrorKind::NotFound
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind() == ApiErrorKind::Auth
    }

    pub fn is_validation_error(&self) -> bool {
        self.kind() == ApiErrorKind::Validation
    }
}

impl From<WireError> for ApiError {
    fn from(err: WireError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            details: err.data.map(|d| d.to_string()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) if !details.is_empty() => {
                write!(f, "API error {}: {} ({})", self.code, self.message, details)
            }
            _ => write!(f, "API error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

// =============================================================================
// Connection Diagnostic
// =============================================================================

fn connection_diagnostic(host: &str, source: &BoxError) -> String {
    format!(
        r#"failed to connect to TrueNAS at "{host}": {source}

Please verify:
  1. The host is reachable (try: curl -k https://{host}{path})
  2. TrueNAS Scale 25.04+ is running and the API service is enabled
  3. Your client configuration is correct

Example configuration:

  host: "192.168.1.100"     # TrueNAS IP or hostname
  api_key: "1-xxxx..."      # API key from the TrueNAS UI
  verify_ssl: false         # set true when the appliance has a valid certificate

Or use environment variables:
  export TRUENAS_HOST="192.168.1.100"
  export TRUENAS_API_KEY="1-xxxx..."
  export TRUENAS_VERIFY_SSL="false"
"#,
        path = crate::config::API_PATH,
    )
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
