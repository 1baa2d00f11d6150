//! Call snapshots and the call table
//!
//! Calls are owned by the engine. The core mirrors what the engine reports
//! on the event stream so hosts can look a call up by id without querying
//! the stack.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::events::UaEvent;
use crate::registration::AccountId;

/// Identifier of a call
pub type CallId = Uuid;

/// Which side created the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    /// User agent client; we sent the INVITE
    Uac,
    /// User agent server; we received the INVITE
    Uas,
}

/// INVITE session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallState {
    Null,
    /// INVITE sent
    Calling,
    /// INVITE received
    Incoming,
    /// Provisional response with tag sent or received
    Early,
    /// 2xx sent or received, waiting for ACK
    Connecting,
    Confirmed,
    Disconnected,
}

impl CallState {
    pub fn is_terminated(self) -> bool {
        self == CallState::Disconnected
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallState::Null => "NULL",
            CallState::Calling => "CALLING",
            CallState::Incoming => "INCOMING",
            CallState::Early => "EARLY",
            CallState::Connecting => "CONNECTING",
            CallState::Confirmed => "CONFIRMED",
            CallState::Disconnected => "DISCONNECTED",
        };
        f.write_str(text)
    }
}

/// Media status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaStatus {
    None,
    Active,
    LocalHold,
    RemoteHold,
    Error,
}

/// Snapshot of a call as last reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallInfo {
    pub id: CallId,
    pub role: CallRole,
    pub account_id: AccountId,
    /// Local URI
    pub local_info: String,
    pub local_contact: Option<String>,
    /// Remote URI
    pub remote_info: String,
    pub remote_contact: Option<String>,
    /// SIP Call-ID header value
    pub sip_call_id: String,
    pub state: CallState,
    pub state_text: String,
    pub last_status: Option<u16>,
    pub last_status_text: Option<String>,
    pub media_status: MediaStatus,
    /// Time since the call was confirmed
    pub connect_duration: Duration,
    /// Time since the call was created
    pub total_duration: Duration,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallInfo {
    pub fn new(
        role: CallRole,
        account_id: AccountId,
        local_info: impl Into<String>,
        remote_info: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            role,
            account_id,
            local_info: local_info.into(),
            local_contact: None,
            remote_info: remote_info.into(),
            remote_contact: None,
            sip_call_id: id.simple().to_string(),
            state: CallState::Null,
            state_text: CallState::Null.to_string(),
            last_status: None,
            last_status_text: None,
            media_status: MediaStatus::None,
            connect_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Move to `state`, recording the status line that caused it
    pub fn transition(&mut self, state: CallState, status: Option<(u16, &str)>) {
        let now = Utc::now();
        self.state = state;
        self.state_text = state.to_string();
        if let Some((code, text)) = status {
            self.last_status = Some(code);
            self.last_status_text = Some(text.to_string());
        }
        if state == CallState::Confirmed && self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
        self.total_duration = (now - self.created_at).to_std().unwrap_or_default();
        self.connect_duration = self
            .connected_at
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or_default();
    }

    pub fn with_state(mut self, state: CallState, status: Option<(u16, &str)>) -> Self {
        self.transition(state, status);
        self
    }
}

/// Calls known to the user agent
///
/// Entries are created when an outgoing call is placed or an incoming call is
/// reported, and dropped once a call reports `Disconnected`.
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: DashMap<CallId, CallInfo>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, call: CallInfo) {
        self.calls.insert(call.id, call);
    }

    pub(crate) fn remove(&self, id: &CallId) -> Option<CallInfo> {
        self.calls.remove(id).map(|(_, call)| call)
    }

    /// Fold one event into the table
    pub(crate) fn apply(&self, event: &UaEvent) {
        match event {
            UaEvent::IncomingCall { call, .. } => self.upsert(call),
            UaEvent::CallStateChanged { call } => self.upsert(call),
            UaEvent::MediaStateChanged { call } => {
                if let Some(mut entry) = self.calls.get_mut(&call.id) {
                    entry.media_status = call.media_status;
                }
            }
            UaEvent::CallReplaced { old_call, new_call } => {
                self.calls.remove(&old_call.id);
                self.upsert(new_call);
            }
            _ => {}
        }
    }

    fn upsert(&self, call: &CallInfo) {
        if call.state.is_terminated() {
            self.calls.remove(&call.id);
        } else {
            self.calls.insert(call.id, call.clone());
        }
    }

    pub fn get(&self, id: &CallId) -> Option<CallInfo> {
        self.calls.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn list(&self) -> Vec<CallInfo> {
        let mut calls: Vec<CallInfo> = self.calls.iter().map(|e| e.value().clone()).collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.calls.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> CallInfo {
        CallInfo::new(
            CallRole::Uac,
            Uuid::new_v4(),
            "sip:alice@example.com",
            "sip:bob@example.com",
        )
    }

    #[test]
    fn transition_records_status_and_connect_time() {
        let mut call = outgoing();
        call.transition(CallState::Early, Some((180, "Ringing")));
        assert_eq!(call.last_status, Some(180));
        assert!(call.connected_at.is_none());

        call.transition(CallState::Confirmed, Some((200, "OK")));
        assert_eq!(call.state_text, "CONFIRMED");
        assert!(call.connected_at.is_some());
    }

    #[test]
    fn disconnected_calls_leave_the_table() {
        let registry = CallRegistry::new();
        let call = outgoing().with_state(CallState::Calling, None);
        registry.apply(&UaEvent::CallStateChanged { call: call.clone() });
        assert!(registry.contains(&call.id));

        let ended = call.with_state(CallState::Disconnected, Some((487, "Request Terminated")));
        registry.apply(&UaEvent::CallStateChanged { call: ended.clone() });
        assert!(!registry.contains(&ended.id));
    }

    #[test]
    fn media_updates_only_touch_known_calls() {
        let registry = CallRegistry::new();
        let mut call = outgoing().with_state(CallState::Confirmed, Some((200, "OK")));
        registry.insert(call.clone());

        call.media_status = MediaStatus::Active;
        registry.apply(&UaEvent::MediaStateChanged { call: call.clone() });
        assert_eq!(registry.get(&call.id).unwrap().media_status, MediaStatus::Active);

        let stranger = outgoing();
        registry.apply(&UaEvent::MediaStateChanged { call: stranger.clone() });
        assert!(!registry.contains(&stranger.id));
    }

    #[test]
    fn replacement_swaps_entries() {
        let registry = CallRegistry::new();
        let old_call = outgoing().with_state(CallState::Confirmed, None);
        let new_call = outgoing().with_state(CallState::Confirmed, None);
        registry.insert(old_call.clone());

        registry.apply(&UaEvent::CallReplaced {
            old_call: old_call.clone(),
            new_call: new_call.clone(),
        });
        assert!(!registry.contains(&old_call.id));
        assert!(registry.contains(&new_call.id));
    }
}
