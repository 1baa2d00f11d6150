//! The user agent handle
//!
//! [`UserAgent`] owns one SIP engine and everything needed to bridge it to a
//! host: the event queue and dispatcher, the account registry and the call
//! table. It moves through three states:
//!
//! ```text
//! Uninitialized ──start──► Running ──stop──► Stopped
//!                             ▲                 │
//!                             └──────start──────┘
//! ```
//!
//! All mutating operations (`start`, `add_account`, `stop` and the call
//! controls) are serialized, so `stop` never interleaves with an
//! `add_account` in flight.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipua_core::{ChannelObserver, LoopbackEngine, RegistrationState, UaConfig, UserAgent};
//!
//! # tokio_test::block_on(async {
//! let config = UaConfig::new().with_bind_addr("127.0.0.1:0".parse().unwrap());
//! let agent = UserAgent::new(Arc::new(LoopbackEngine::new()), config);
//!
//! let (observer, _events) = ChannelObserver::new();
//! agent.start(observer).await.unwrap();
//!
//! let id = agent.add_account("alice", "sip.example.com", "secret").await.unwrap();
//! let state = agent.wait_for_registration(id, Duration::from_secs(1)).await.unwrap();
//! assert_eq!(state, RegistrationState::Registered);
//!
//! agent.stop().await.unwrap();
//! # })
//! ```

mod accounts;
mod builder;
mod calls;
mod lifecycle;


pub use builder::UserAgentBuilder;

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::call::CallRegistry;
use crate::config::UaConfig;
use crate::dispatch::{DispatchSnapshot, DispatchStats, DispatcherHandle, EventSink};
use crate::engine::SipEngine;
use crate::registration::AccountRegistry;

/// Lifecycle state of a [`UserAgent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Never started
    Uninitialized,
    Running,
    /// Stopped; may be started again
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "Uninitialized"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Tasks and channels that exist only while the engine runs
struct Running {
    sink: EventSink,
    worker: JoinHandle<()>,
    worker_token: CancellationToken,
    dispatcher: DispatcherHandle,
}

/// Handle to a SIP engine bridged to a host observer
pub struct UserAgent {
    config: UaConfig,
    engine: Arc<dyn SipEngine>,
    accounts: Arc<AccountRegistry>,
    calls: Arc<CallRegistry>,
    dispatch_stats: Arc<DispatchStats>,
    state: RwLock<EngineState>,
    running: Mutex<Option<Running>>,
}

impl UserAgent {
    /// Create a handle over `engine`; nothing runs until [`start`](Self::start)
    pub fn new(engine: Arc<dyn SipEngine>, config: UaConfig) -> Self {
        Self {
            config,
            engine,
            accounts: Arc::new(AccountRegistry::new()),
            calls: Arc::new(CallRegistry::new()),
            dispatch_stats: Arc::new(DispatchStats::default()),
            state: RwLock::new(EngineState::Uninitialized),
            running: Mutex::new(None),
        }
    }

    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    pub fn config(&self) -> &UaConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Direct access to the account registry
    pub fn registry(&self) -> &AccountRegistry {
        &self.accounts
    }

    /// Delivery counters since this handle was created
    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.dispatch_stats.snapshot()
    }

    fn set_state(&self, state: EngineState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Engine state changed");
        }
    }
}

impl fmt::Debug for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAgent")
            .field("state", &self.state())
            .field("accounts", &self.accounts.len())
            .field("calls", &self.calls.len())
            .finish()
    }
}

impl Drop for UserAgent {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            tracing::warn!("UserAgent dropped while running; cancelling engine tasks without deregistering");
            running.worker_token.cancel();
            running.dispatcher.cancel();
        }
    }
}
