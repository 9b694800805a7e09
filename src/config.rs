//! Client Configuration
//!
//! Connection settings supplied by the caller. The engine never reads the
//! environment itself; the CLI layers env vars and a YAML file on top.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Well-known path of the WebSocket API endpoint
pub const API_PATH: &str = "/api/current";

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between job status polls
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for a client connection
#[derive(Clone)]
pub struct ClientConfig {
    /// Appliance hostname or IP, optionally with `:port`
    pub host: String,
    /// API key exchanged during the handshake
    pub api_key: String,
    /// Verify the appliance's TLS certificate
    pub verify_ssl: bool,
    /// Dial, write and per-call response timeout
    pub timeout: Duration,
    /// Interval between job status polls
    pub job_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            verify_ssl: true,
            timeout: DEFAULT_TIMEOUT,
            job_poll_interval: DEFAULT_JOB_POLL_INTERVAL,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("api_key", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout", &self.timeout)
            .field("job_poll_interval", &self.job_poll_interval)
            .finish()
    }
}

impl ClientConfig {
    /// Create a config for `host` authenticating with `api_key`
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    /// Override the timeout; a zero duration keeps the default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    pub fn with_job_poll_interval(mut self, interval: Duration) -> Self {
        self.job_poll_interval = interval;
        self
    }

    /// WebSocket URL of the API endpoint
    pub fn url(&self) -> String {
        format!("wss://{}{}", self.host, API_PATH)
    }

    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration(
                "missing host: set it in the configuration or via TRUENAS_HOST".into(),
            ));
        }
        if self.api_key.is_empty() {
            return Err(Error::Configuration(
                "missing API key: set it in the configuration or via TRUENAS_API_KEY".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration("timeout must be greater than zero".into()));
        }
        if self.job_poll_interval.is_zero() {
            return Err(Error::Configuration(
                "job poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Load from YAML text; absent fields take their defaults
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        Ok(file.into_config())
    }
}

// =============================================================================
// Config File
// =============================================================================

/// On-disk shape of the configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    verify_ssl: Option<bool>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    job_poll_interval_secs: Option<u64>,
}

impl ConfigFile {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(api_key) = self.api_key {
            config.api_key = api_key;
        }
        if let Some(verify_ssl) = self.verify_ssl {
            config.verify_ssl = verify_ssl;
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.job_poll_interval_secs.filter(|s| *s > 0) {
            config.job_poll_interval = Duration::from_secs(secs);
        }
        config
    }
}
