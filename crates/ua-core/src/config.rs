//! Configuration for the user agent core
//!
//! [`UaConfig`] carries the transport the engine binds, the capacity of the
//! event queue, and the bounded waits used by `stop`. It can be built in code
//! with the `with_*` methods or loaded from TOML.
//!
//! # Examples
//!
//! ```rust
//! use sipua_core::config::UaConfig;
//! use std::time::Duration;
//!
//! let config = UaConfig::new()
//!     .with_bind_addr("127.0.0.1:0".parse().unwrap())
//!     .with_event_queue_capacity(64)
//!     .with_shutdown_grace(Duration::from_secs(2));
//!
//! assert_eq!(config.event_queue_capacity, 64);
//! assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
//! ```
//!
//! ```rust
//! use sipua_core::config::UaConfig;
//!
//! let config = UaConfig::from_toml_str(r#"
//!     user_agent = "desk-phone/1.0"
//!     event_queue_capacity = 256
//!
//!     [transport]
//!     protocol = "udp"
//!     bind_addr = "0.0.0.0:5070"
//! "#).unwrap();
//!
//! assert_eq!(config.transport.bind_addr.port(), 5070);
//! assert_eq!(config.deregistration_timeout_ms, 5_000);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{UaError, UaResult};

/// Default SIP signaling port
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Transport protocol the engine binds for signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Signaling transport configuration handed to the engine on `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport protocol
    #[serde(default = "default_protocol")]
    pub protocol: TransportProtocol,
    /// Local address to bind; port 0 lets the OS pick
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

fn default_protocol() -> TransportProtocol {
    TransportProtocol::Udp
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_SIP_PORT))
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Top-level configuration of a [`UserAgent`](crate::UserAgent)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UaConfig {
    /// Signaling transport
    pub transport: TransportConfig,
    /// User-Agent string the engine advertises
    pub user_agent: String,
    /// Capacity of the bounded queue between the engine worker and the dispatcher
    pub event_queue_capacity: usize,
    /// How long `stop` waits for accounts to deregister, in milliseconds
    pub deregistration_timeout_ms: u64,
    /// How long `stop` waits for each of worker, engine and dispatcher to halt, in milliseconds
    pub shutdown_grace_ms: u64,
    /// Registration expiry requested from the registrar, in seconds
    pub registration_expires: u32,
}

impl Default for UaConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            user_agent: format!("sipua/{}", env!("CARGO_PKG_VERSION")),
            event_queue_capacity: 1024,
            deregistration_timeout_ms: 5_000,
            shutdown_grace_ms: 5_000,
            registration_expires: 3600,
        }
    }
}

impl UaConfig {
    /// Create a configuration with default values
    ///
    /// UDP on `0.0.0.0:5060`, a 1024-event queue and five second bounded
    /// waits during shutdown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(input: &str) -> UaResult<Self> {
        let config: UaConfig = toml::from_str(input)
            .map_err(|e| UaError::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> UaResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| UaError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Check internal consistency
    pub fn validate(&self) -> UaResult<()> {
        if self.event_queue_capacity == 0 {
            return Err(UaError::config("event_queue_capacity must be greater than zero"));
        }
        if self.deregistration_timeout_ms == 0 {
            return Err(UaError::config("deregistration_timeout_ms must be greater than zero"));
        }
        if self.shutdown_grace_ms == 0 {
            return Err(UaError::config("shutdown_grace_ms must be greater than zero"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(UaError::config("user_agent must not be empty"));
        }
        Ok(())
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.transport.bind_addr = addr;
        self
    }

    pub fn with_protocol(mut self, protocol: TransportProtocol) -> Self {
        self.transport.protocol = protocol;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_deregistration_timeout(mut self, timeout: Duration) -> Self {
        self.deregistration_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_registration_expires(mut self, expires: u32) -> Self {
        self.registration_expires = expires;
        self
    }

    /// Bounded wait for deregistrations during `stop`
    pub fn deregistration_timeout(&self) -> Duration {
        Duration::from_millis(self.deregistration_timeout_ms)
    }

    /// Bounded wait for each halting step during `stop`
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
