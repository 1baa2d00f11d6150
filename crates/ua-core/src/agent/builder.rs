//! Fluent construction of a [`UserAgent`]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::UserAgent;
use crate::config::UaConfig;
use crate::engine::{LoopbackEngine, SipEngine};
use crate::error::UaResult;

/// Builder for [`UserAgent`]
///
/// Without an explicit engine the agent runs over a [`LoopbackEngine`].
///
/// ```rust
/// use std::time::Duration;
/// use sipua_core::UserAgent;
///
/// let agent = UserAgent::builder()
///     .bind_addr("127.0.0.1:0".parse().unwrap())
///     .event_queue_capacity(128)
///     .shutdown_grace(Duration::from_millis(500))
///     .build()
///     .unwrap();
/// assert_eq!(agent.config().event_queue_capacity, 128);
/// ```
#[derive(Default)]
pub struct UserAgentBuilder {
    config: UaConfig,
    engine: Option<Arc<dyn SipEngine>>,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(mut self, engine: Arc<dyn SipEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: UaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config = self.config.with_bind_addr(addr);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config = self.config.with_user_agent(user_agent);
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config = self.config.with_event_queue_capacity(capacity);
        self
    }

    pub fn deregistration_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_deregistration_timeout(timeout);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config = self.config.with_shutdown_grace(grace);
        self
    }

    /// Validate the configuration and create the handle
    pub fn build(self) -> UaResult<UserAgent> {
        self.config.validate()?;
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(LoopbackEngine::new()) as Arc<dyn SipEngine>);
        Ok(UserAgent::new(engine, self.config))
    }
}
