//! # sipua-core - SIP User Agent Control Loop
//!
//! This crate is the event-bridging and session-lifecycle core of a SIP user
//! agent. It sits between a SIP protocol engine and a host application:
//!
//! - **Lifecycle**: start the engine, keep its worker running in the
//!   background, and shut it down cleanly (deregistering accounts first)
//! - **Events**: marshal everything the engine reports into one ordered
//!   stream delivered to a single observer
//! - **Accounts**: create accounts, track their registration state
//! - **Calls**: place, answer and hang up calls on registered accounts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sipua_core::{observer_fn, LoopbackEngine, UaConfig, UserAgent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = UserAgent::new(Arc::new(LoopbackEngine::new()), UaConfig::default());
//!
//!     agent.start(observer_fn(|kind, event| {
//!         println!("{} {}", kind, event.payload());
//!         Ok(())
//!     })).await?;
//!
//!     agent.add_account("alice", "sip.example.com", "secret").await?;
//!     tokio::time::sleep(Duration::from_secs(3)).await;
//!
//!     agent.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  engine worker ──EventSink──► bounded queue ──► dispatcher ──► observer
//!        ▲                                            │
//!        │                                            ▼
//!   UserAgent (start / add_account / stop)    account + call tables
//! ```
//!
//! The SIP stack itself is consumed through the [`SipEngine`] trait.
//! [`LoopbackEngine`] is a scripted in-process implementation used by the
//! tests and the demo.

pub mod agent;
pub mod call;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod registration;

pub use agent::{EngineState, UserAgent, UserAgentBuilder};
pub use call::{CallId, CallInfo, CallRole, CallState, MediaStatus};
pub use config::{TransportConfig, TransportProtocol, UaConfig};
pub use dispatch::{DispatchSnapshot, EventSink};
pub use engine::{EngineError, LoopbackBehavior, LoopbackEngine, RegistrarResponse, SipEngine};
pub use error::{ShutdownPhase, UaError, UaResult};
pub use events::{observer_fn, ChannelObserver, EventKind, EventObserver, RegistrationInfo, UaEvent};
pub use registration::{Account, AccountId, AccountParams, Gateway, RegistrationState, RegistrationStats, Secret};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
