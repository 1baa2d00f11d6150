//! Tracing subscriber setup for hosts embedding the user agent
//!
//! The library itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`setup_logging`].

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{UaError, UaResult};

/// How [`setup_logging`] formats output
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted unless `RUST_LOG` says otherwise
    pub level: Level,
    /// One JSON object per line instead of the human-readable format
    pub json: bool,
    /// Named in the first line logged
    pub app_name: String,
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            json: false,
            app_name: app_name.into(),
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` directives are honoured and combined with the configured level.
/// Returns an error if another global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> UaResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let builder = fmt::Subscriber::builder().with_env_filter(filter);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| UaError::config(format!("cannot install tracing subscriber: {}", e)))?;
    tracing::info!("Starting {} v{}", config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a log level from a string such as `"debug"`
pub fn parse_log_level(level: &str) -> UaResult<Level> {
    Level::from_str(level).map_err(|_| UaError::config(format!("Invalid log level: {}", level)))
}
