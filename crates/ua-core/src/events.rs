//! Events delivered to the host observer
//!
//! Everything the SIP engine reports arrives as a [`UaEvent`]. Events are
//! delivered one at a time, in the order the engine produced them, to the
//! single [`EventObserver`] passed to [`UserAgent::start`](crate::UserAgent::start).
//!
//! # Event Kinds
//!
//! | Kind | Name | Payload |
//! |---|---|---|
//! | [`EventKind::RegistrationStateChanged`] | `reg_state` | [`RegistrationInfo`] |
//! | [`EventKind::IncomingCall`] | `incoming_call` | account and [`CallInfo`] |
//! | [`EventKind::CallStateChanged`] | `call_state` | [`CallInfo`] |
//! | [`EventKind::TransactionStateChanged`] | `tsx_state` | call, method, status |
//! | [`EventKind::MediaStateChanged`] | `media_state` | [`CallInfo`] |
//! | [`EventKind::StreamCreated`] | `stream_created` | call, stream index |
//! | [`EventKind::StreamDestroyed`] | `stream_destroyed` | call, stream index |
//! | [`EventKind::DtmfDigit`] | `dtmf_digit` | call, digit |
//! | [`EventKind::TransferRequest`] | `transfer_request` | call, target |
//! | [`EventKind::TransferStatus`] | `transfer_status` | call, status |
//! | [`EventKind::CallReplaced`] | `call_replaced` | old and new call |
//! | [`EventKind::IncomingSubscribe`] | `incoming_subscribe` | account, subscriber |
//! | [`EventKind::EngineError`] | `engine_error` | message |
//! | [`EventKind::ObserverError`] | `observer_error` | failed kind, message |
//!
//! # Observers
//!
//! Any closure taking `(EventKind, &UaEvent)` and returning
//! `anyhow::Result<()>` is an observer. Wrap it with [`observer_fn`]:
//!
//! ```rust
//! use sipua_core::events::{observer_fn, EventKind};
//!
//! let observer = observer_fn(|kind, event| {
//!     if kind == EventKind::RegistrationStateChanged {
//!         println!("{}: {}", kind, event.payload());
//!     }
//!     Ok(())
//! });
//! # let _ = observer;
//! ```
//!
//! Hosts that prefer to pull events can use [`ChannelObserver`], which
//! forwards every event into an unbounded tokio channel.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::call::{CallId, CallInfo};
use crate::registration::{AccountId, RegistrationState};

/// Discriminant of a [`UaEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    RegistrationStateChanged,
    IncomingCall,
    CallStateChanged,
    TransactionStateChanged,
    MediaStateChanged,
    StreamCreated,
    StreamDestroyed,
    DtmfDigit,
    TransferRequest,
    TransferStatus,
    CallReplaced,
    IncomingSubscribe,
    EngineError,
    ObserverError,
}

impl EventKind {
    /// Short wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RegistrationStateChanged => "reg_state",
            EventKind::IncomingCall => "incoming_call",
            EventKind::CallStateChanged => "call_state",
            EventKind::TransactionStateChanged => "tsx_state",
            EventKind::MediaStateChanged => "media_state",
            EventKind::StreamCreated => "stream_created",
            EventKind::StreamDestroyed => "stream_destroyed",
            EventKind::DtmfDigit => "dtmf_digit",
            EventKind::TransferRequest => "transfer_request",
            EventKind::TransferStatus => "transfer_status",
            EventKind::CallReplaced => "call_replaced",
            EventKind::IncomingSubscribe => "incoming_subscribe",
            EventKind::EngineError => "engine_error",
            EventKind::ObserverError => "observer_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration outcome for one account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationInfo {
    pub account_id: AccountId,
    pub user: String,
    /// Address of record
    pub uri: String,
    pub state: RegistrationState,
    /// SIP status code of the last REGISTER response, if any
    pub status_code: Option<u16>,
    /// Reason phrase or failure description
    pub reason: Option<String>,
    /// Binding lifetime granted by the registrar, in seconds
    pub expires: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl RegistrationInfo {
    pub fn new(
        account_id: AccountId,
        user: impl Into<String>,
        uri: impl Into<String>,
        state: RegistrationState,
    ) -> Self {
        Self {
            account_id,
            user: user.into(),
            uri: uri.into(),
            state,
            status_code: None,
            reason: None,
            expires: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, code: u16, reason: impl Into<String>) -> Self {
        self.status_code = Some(code);
        self.reason = Some(reason.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// An event reported by the SIP engine or the dispatcher
///
/// Serializes to the bare payload; use [`UaEvent::to_json`] for a
/// `{"kind": .., "argument": ..}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UaEvent {
    RegistrationStateChanged(RegistrationInfo),
    IncomingCall {
        account_id: AccountId,
        call: CallInfo,
    },
    CallStateChanged {
        call: CallInfo,
    },
    TransactionStateChanged {
        call: CallInfo,
        method: String,
        status_code: Option<u16>,
    },
    MediaStateChanged {
        call: CallInfo,
    },
    StreamCreated {
        call: CallInfo,
        stream_index: u32,
    },
    StreamDestroyed {
        call: CallInfo,
        stream_index: u32,
    },
    DtmfDigit {
        call: CallInfo,
        digit: char,
    },
    TransferRequest {
        call: CallInfo,
        target: String,
    },
    TransferStatus {
        call: CallInfo,
        status_code: u16,
        status_text: String,
        is_final: bool,
    },
    CallReplaced {
        old_call: CallInfo,
        new_call: CallInfo,
    },
    IncomingSubscribe {
        account_id: AccountId,
        from: String,
        event_package: String,
    },
    /// An asynchronous failure inside the engine
    EngineError {
        account_id: Option<AccountId>,
        message: String,
    },
    /// The observer failed while handling an event of `kind`
    ObserverError {
        kind: EventKind,
        message: String,
    },
}

impl UaEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            UaEvent::RegistrationStateChanged(_) => EventKind::RegistrationStateChanged,
            UaEvent::IncomingCall { .. } => EventKind::IncomingCall,
            UaEvent::CallStateChanged { .. } => EventKind::CallStateChanged,
            UaEvent::TransactionStateChanged { .. } => EventKind::TransactionStateChanged,
            UaEvent::MediaStateChanged { .. } => EventKind::MediaStateChanged,
            UaEvent::StreamCreated { .. } => EventKind::StreamCreated,
            UaEvent::StreamDestroyed { .. } => EventKind::StreamDestroyed,
            UaEvent::DtmfDigit { .. } => EventKind::DtmfDigit,
            UaEvent::TransferRequest { .. } => EventKind::TransferRequest,
            UaEvent::TransferStatus { .. } => EventKind::TransferStatus,
            UaEvent::CallReplaced { .. } => EventKind::CallReplaced,
            UaEvent::IncomingSubscribe { .. } => EventKind::IncomingSubscribe,
            UaEvent::EngineError { .. } => EventKind::EngineError,
            UaEvent::ObserverError { .. } => EventKind::ObserverError,
        }
    }

    /// The account this event concerns, if any
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            UaEvent::RegistrationStateChanged(info) => Some(info.account_id),
            UaEvent::IncomingCall { account_id, .. }
            | UaEvent::IncomingSubscribe { account_id, .. } => Some(*account_id),
            UaEvent::EngineError { account_id, .. } => *account_id,
            UaEvent::ObserverError { .. } => None,
            UaEvent::CallReplaced { new_call, .. } => Some(new_call.account_id),
            other => other.call().map(|call| call.account_id),
        }
    }

    /// The call this event concerns, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            UaEvent::CallReplaced { new_call, .. } => Some(new_call.id),
            other => other.call().map(|call| call.id),
        }
    }

    fn call(&self) -> Option<&CallInfo> {
        match self {
            UaEvent::IncomingCall { call, .. }
            | UaEvent::CallStateChanged { call }
            | UaEvent::TransactionStateChanged { call, .. }
            | UaEvent::MediaStateChanged { call }
            | UaEvent::StreamCreated { call, .. }
            | UaEvent::StreamDestroyed { call, .. }
            | UaEvent::DtmfDigit { call, .. }
            | UaEvent::TransferRequest { call, .. }
            | UaEvent::TransferStatus { call, .. } => Some(call),
            _ => None,
        }
    }

    /// Registration payload, for `RegistrationStateChanged` events
    pub fn registration(&self) -> Option<&RegistrationInfo> {
        match self {
            UaEvent::RegistrationStateChanged(info) => Some(info),
            _ => None,
        }
    }

    /// Untyped payload for hosts that forward events as JSON
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// `{"kind": "<name>", "argument": <payload>}`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind().as_str(),
            "argument": self.payload(),
        })
    }
}

/// Receives events from the dispatcher
///
/// `on_event` runs on the dispatcher task, one event at a time. Returning an
/// error (or panicking) does not stop delivery; the dispatcher logs the fault
/// and reports it with an [`UaEvent::ObserverError`].
pub trait EventObserver: Send + Sync + 'static {
    fn on_event(&self, kind: EventKind, event: &UaEvent) -> anyhow::Result<()>;
}

impl<F> EventObserver for F
where
    F: Fn(EventKind, &UaEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, kind: EventKind, event: &UaEvent) -> anyhow::Result<()> {
        self(kind, event)
    }
}

/// Wrap a closure as a shareable observer
pub fn observer_fn<F>(f: F) -> Arc<dyn EventObserver>
where
    F: Fn(EventKind, &UaEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Observer that forwards every event into an unbounded channel
///
/// ```rust
/// use sipua_core::events::ChannelObserver;
///
/// let (observer, mut events) = ChannelObserver::new();
/// # let _ = (observer, &mut events);
/// ```
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UaEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<dyn EventObserver>, mpsc::UnboundedReceiver<UaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelObserver { tx }), rx)
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, kind: EventKind, event: &UaEvent) -> anyhow::Result<()> {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(%kind, "Event receiver dropped, discarding event");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallRole, CallState};
    use uuid::Uuid;

    fn registration(state: RegistrationState) -> UaEvent {
        UaEvent::RegistrationStateChanged(
            RegistrationInfo::new(Uuid::new_v4(), "alice", "sip:alice@sip.example.com", state)
                .with_status(200, "OK"),
        )
    }

    #[test]
    fn kind_names_match_wire_names() {
        assert_eq!(EventKind::RegistrationStateChanged.as_str(), "reg_state");
        assert_eq!(EventKind::TransactionStateChanged.as_str(), "tsx_state");
        assert_eq!(EventKind::ObserverError.to_string(), "observer_error");
    }

    #[test]
    fn payload_is_untagged_and_envelope_names_kind() {
        let event = registration(RegistrationState::Registered);
        let payload = event.payload();
        assert_eq!(payload["state"], "Registered");
        assert_eq!(payload["uri"], "sip:alice@sip.example.com");
        assert_eq!(payload["status_code"], 200);

        let envelope = event.to_json();
        assert_eq!(envelope["kind"], "reg_state");
        assert_eq!(envelope["argument"]["user"], "alice");
    }

    #[test]
    fn attribution_to_account_and_call() {
        let account_id = Uuid::new_v4();
        let call = CallInfo::new(CallRole::Uas, account_id, "sip:alice@h", "sip:bob@h")
            .with_state(CallState::Incoming, None);
        let event = UaEvent::DtmfDigit { call: call.clone(), digit: '5' };
        assert_eq!(event.account_id(), Some(account_id));
        assert_eq!(event.call_id(), Some(call.id));

        let fault = UaEvent::ObserverError {
            kind: EventKind::DtmfDigit,
            message: "boom".into(),
        };
        assert_eq!(fault.account_id(), None);
        assert_eq!(fault.call_id(), None);
    }

    #[test]
    fn closures_are_observers() {
        let observer = observer_fn(|kind, _event| {
            anyhow::ensure!(kind != EventKind::EngineError, "engine errors are fatal here");
            Ok(())
        });
        let event = registration(RegistrationState::Registering);
        assert!(observer.on_event(event.kind(), &event).is_ok());

        let err = UaEvent::EngineError { account_id: None, message: "x".into() };
        assert!(observer.on_event(err.kind(), &err).is_err());
    }

    #[tokio::test]
    async fn channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::new();
        let event = registration(RegistrationState::Registered);
        observer.on_event(event.kind(), &event).unwrap();
        assert_eq!(rx.recv().await, Some(event));
    }
}
