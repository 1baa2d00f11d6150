//! The SIP engine capability
//!
//! The user agent never speaks SIP itself. It drives an engine through
//! [`SipEngine`]: initialize a transport, hand over an [`EventSink`], run the
//! worker loop as a background task, register and deregister accounts, and
//! release everything on shutdown.
//!
//! The engine value is its own context; a user agent holds it as
//! `Arc<dyn SipEngine>`.
//!
//! [`LoopbackEngine`] is an in-process engine that binds a real signaling
//! socket and plays registrar and remote peer. It backs the tests and the
//! demo, and is a reference for writing adapters over a real SIP stack.

mod loopback;

pub use loopback::{LoopbackBehavior, LoopbackEngine, RegistrarResponse};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::call::{CallId, CallInfo};
use crate::config::TransportConfig;
use crate::dispatch::EventSink;
use crate::registration::{AccountId, AccountParams};

/// Errors reported by an engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The signaling transport could not be bound
    #[error("Failed to bind transport on {addr}: {message}")]
    TransportBind { addr: String, message: String },

    /// The engine refused the request outright
    #[error("Rejected: {reason}")]
    Rejected { reason: String },

    /// Any other engine failure
    #[error("Internal engine error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Narrow interface to a SIP protocol stack
///
/// Outcomes of asynchronous work (registration results, call progress) must
/// be reported through the [`EventSink`] given to
/// [`set_event_sink`](SipEngine::set_event_sink), in the order they happen.
#[async_trait]
pub trait SipEngine: Send + Sync + 'static {
    /// Create the stack and bind the signaling transport
    async fn init(&self, transport: &TransportConfig) -> Result<(), EngineError>;

    /// Install the sink for engine events; called after a successful `init`
    fn set_event_sink(&self, sink: EventSink);

    /// Worker loop; must return promptly once `shutdown` is cancelled
    async fn run(&self, shutdown: CancellationToken);

    /// Start registering an account; must not wait for the registrar
    async fn register_account(&self, id: AccountId, params: &AccountParams) -> Result<(), EngineError>;

    /// Start removing an account's binding; completion is reported as an event
    async fn deregister_account(&self, id: AccountId);

    /// Place the outgoing call described by `call`
    ///
    /// `call` is already in the call table in state `Calling`. The engine
    /// keeps its id and reports every later change as an event.
    async fn make_call(&self, call: &CallInfo) -> Result<(), EngineError>;

    /// Respond to an incoming call with `status_code`
    async fn answer_call(&self, call_id: CallId, status_code: u16) -> Result<(), EngineError>;

    /// Terminate a call; `status_code` applies to calls not yet answered
    async fn hangup_call(&self, call_id: CallId, status_code: Option<u16>) -> Result<(), EngineError>;

    /// Release the transport and all stack resources
    async fn shutdown(&self) -> Result<(), EngineError>;
}
