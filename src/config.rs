//! Transport configuration
//!
//! All tunables for the handshake, transport workers and the Tor
//! collaborators live here. Configurations can be loaded from and saved to
//! JSON files.

use crate::error::{CommError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default port the server side binds to
pub const DEFAULT_BIND_PORT: u16 = 42790;

/// Default Tor control port
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Configuration for a transport endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Local address the server side binds to
    pub bind_address: String,

    /// Port used by `TransportProtocol::bind_default`
    pub bind_port: u16,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Overall handshake budget in milliseconds
    pub handshake_timeout_ms: u64,

    /// Interval at which the synchronous handshake wrapper checks the stage
    pub handshake_poll_ms: u64,

    /// Idle sleep of the inbound/outbound workers
    pub worker_poll_ms: u64,

    /// Interval of the background data-available notifier
    pub notifier_poll_ms: u64,

    /// Attempts the outbound worker makes to lock its queue before yielding
    pub dequeue_retry_limit: u32,

    /// Maximum number of plaintext messages held per queue
    pub max_queue_len: usize,

    /// Largest frame accepted from the wire, in bytes
    pub max_frame_len: usize,

    /// Tor SOCKS proxy (`host:port`) used to reach onion services
    pub socks_proxy: Option<String>,

    /// Tor control port settings
    pub control: ControlConfig,
}

/// Tor control port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control port address
    pub address: String,

    /// Control port
    pub port: u16,

    /// Password sent with `AUTHENTICATE`
    pub password: String,

    /// Reply timeout in milliseconds
    pub reply_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_CONTROL_PORT,
            password: String::new(),
            reply_timeout_ms: 10_000,
        }
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: DEFAULT_BIND_PORT,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 30_000,
            handshake_poll_ms: 500,
            worker_poll_ms: 100,
            notifier_poll_ms: 500,
            dequeue_retry_limit: 0xFFFF,
            max_queue_len: 4096,
            max_frame_len: 16 * 1024 * 1024,
            socks_proxy: None,
            control: ControlConfig::default(),
        }
    }
}

impl CommConfig {
    /// Config tuned for fast local round-trips (tests, loopback demos)
    pub fn fast() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            handshake_poll_ms: 5,
            worker_poll_ms: 5,
            notifier_poll_ms: 5,
            ..Default::default()
        }
    }

    /// Create config that tunnels client connections through a SOCKS proxy
    pub fn with_socks_proxy(proxy: impl Into<String>) -> Self {
        Self {
            socks_proxy: Some(proxy.into()),
            ..Default::default()
        }
    }

    /// Override the overall handshake budget
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Override the worker idle sleep
    pub fn with_worker_poll(mut self, interval: Duration) -> Self {
        self.worker_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn notifier_poll(&self) -> Duration {
        Duration::from_millis(self.notifier_poll_ms)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(CommError::Config("handshake_timeout_ms must be > 0".into()));
        }
        if self.handshake_poll_ms == 0 || self.worker_poll_ms == 0 || self.notifier_poll_ms == 0 {
            return Err(CommError::Config("poll intervals must be > 0".into()));
        }
        if self.dequeue_retry_limit == 0 {
            return Err(CommError::Config("dequeue_retry_limit must be > 0".into()));
        }
        if self.max_queue_len == 0 {
            return Err(CommError::Config("max_queue_len must be > 0".into()));
        }
        // Must at least fit an encrypted session token
        if self.max_frame_len < 1024 {
            return Err(CommError::Config("max_frame_len must be >= 1024".into()));
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CommConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CommError::Config(format!("{}: {}", path.display(), e)))?;
        log::info!("⚙️ Loading configuration from {}", path.display());
        Self::from_json(&json)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| CommError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}
