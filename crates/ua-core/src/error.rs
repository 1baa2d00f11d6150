//! Error types for the user agent core
//!
//! Synchronous failures of the control surface are returned as [`UaError`].
//! Asynchronous outcomes (registration results, call progress) are never
//! returned from the call that triggered them; they arrive on the event
//! stream instead.

use std::time::Duration;

use thiserror::Error;

use crate::call::CallId;
use crate::engine::EngineError;
use crate::registration::AccountId;

/// Result type for user agent operations
pub type UaResult<T> = Result<T, UaError>;

/// Phase of [`UserAgent::stop`](crate::UserAgent::stop) that ran out of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Waiting for accounts to deregister
    Deregistration,
    /// Waiting for the engine worker task to halt
    Worker,
    /// Waiting for the engine to release its transport
    Engine,
    /// Waiting for the dispatcher to drain the event queue
    Dispatcher,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Deregistration => write!(f, "deregistration"),
            ShutdownPhase::Worker => write!(f, "worker"),
            ShutdownPhase::Engine => write!(f, "engine"),
            ShutdownPhase::Dispatcher => write!(f, "dispatcher"),
        }
    }
}

/// Errors that can occur in the user agent core
#[derive(Debug, Error)]
pub enum UaError {
    /// The SIP stack could not be initialized (e.g. transport bind failure)
    #[error("Engine initialization failed: {message}")]
    EngineInit { message: String },

    /// `start` was called on a handle that is already running
    #[error("Engine is already running")]
    AlreadyRunning,

    /// The operation requires a running engine
    #[error("Engine is not running")]
    EngineNotRunning,

    /// Account parameters were rejected before any state was touched
    #[error("Invalid account parameters: {reason}")]
    InvalidAccountParams { reason: String },

    /// An account with the same address of record is already active
    #[error("Account already registered or registering: {uri}")]
    DuplicateAccount { uri: String },

    /// No account with this identifier
    #[error("Account not found: {account_id}")]
    AccountNotFound { account_id: AccountId },

    /// No call with this identifier
    #[error("Call not found: {call_id}")]
    CallNotFound { call_id: CallId },

    /// Call parameters were rejected
    #[error("Invalid call parameters: {reason}")]
    InvalidCallParams { reason: String },

    /// The engine refused an operation
    #[error("Engine error: {message}")]
    Engine { message: String },

    /// Graceful shutdown did not finish in time; the handle is stopped anyway
    #[error("Shutdown timed out during {phase} after {grace:?}")]
    ShutdownTimeout { phase: ShutdownPhase, grace: Duration },

    /// The event queue has been closed by `stop`
    #[error("Event channel closed")]
    EventChannelClosed,

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl UaError {
    /// Create an engine initialization error
    pub fn engine_init(message: impl Into<String>) -> Self {
        Self::EngineInit {
            message: message.into(),
        }
    }

    /// Create an invalid account parameters error
    pub fn invalid_account(reason: impl Into<String>) -> Self {
        Self::InvalidAccountParams {
            reason: reason.into(),
        }
    }

    /// Create an invalid call parameters error
    pub fn invalid_call(reason: impl Into<String>) -> Self {
        Self::InvalidCallParams {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an engine error
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Whether the caller can recover by retrying after fixing the precondition
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UaError::EngineInit { .. }
                | UaError::EngineNotRunning
                | UaError::AlreadyRunning
                | UaError::InvalidAccountParams { .. }
                | UaError::InvalidCallParams { .. }
        )
    }
}

impl From<EngineError> for UaError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::TransportBind { .. } => UaError::engine_init(err.to_string()),
            EngineError::Rejected { reason } => UaError::InvalidAccountParams { reason },
            other => UaError::engine(other.to_string()),
        }
    }
}
