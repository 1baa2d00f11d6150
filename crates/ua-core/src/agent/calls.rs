//! Call controls on the user agent

use tracing::info;

use super::UserAgent;
use crate::call::{CallId, CallInfo, CallRole, CallState};
use crate::engine::EngineError;
use crate::error::{UaError, UaResult};
use crate::registration::AccountId;

fn validate_dest_uri(uri: &str) -> UaResult<()> {
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .ok_or_else(|| UaError::invalid_call(format!("'{}' is not a sip: or sips: URI", uri)))?;
    if rest.is_empty() || rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(UaError::invalid_call(format!("'{}' is not a valid destination", uri)));
    }
    Ok(())
}

fn call_error(err: EngineError) -> UaError {
    match err {
        EngineError::Rejected { reason } => UaError::InvalidCallParams { reason },
        other => other.into(),
    }
}

fn validate_status_code(code: u16) -> UaResult<()> {
    if (100..=699).contains(&code) {
        Ok(())
    } else {
        Err(UaError::invalid_call(format!("status code {} is out of range", code)))
    }
}

impl UserAgent {
    /// Place a call from `account_id` to `dest_uri`
    ///
    /// Progress is reported as `CallStateChanged` events.
    pub async fn make_call(&self, account_id: AccountId, dest_uri: &str) -> UaResult<CallId> {
        let running = self.running.lock().await;
        if running.is_none() {
            return Err(UaError::EngineNotRunning);
        }
        let account = self
            .accounts
            .get(&account_id)
            .ok_or(UaError::AccountNotFound { account_id })?;
        validate_dest_uri(dest_uri)?;

        // must be in the table before the engine can report progress on it
        let call = CallInfo::new(CallRole::Uac, account_id, account.uri, dest_uri)
            .with_state(CallState::Calling, None);
        let call_id = call.id;
        self.calls.insert(call.clone());

        if let Err(e) = self.engine.make_call(&call).await {
            self.calls.remove(&call_id);
            return Err(call_error(e));
        }
        info!(%call_id, %account_id, to = dest_uri, "Outgoing call");
        Ok(call_id)
    }

    /// Answer an incoming call with 200 OK
    pub async fn answer(&self, call_id: CallId) -> UaResult<()> {
        self.answer_call(call_id, 200).await
    }

    /// Respond to an incoming call with `status_code`
    ///
    /// 1xx codes send a provisional response, 2xx accept the call and
    /// anything else rejects it.
    pub async fn answer_call(&self, call_id: CallId, status_code: u16) -> UaResult<()> {
        let running = self.running.lock().await;
        if running.is_none() {
            return Err(UaError::EngineNotRunning);
        }
        validate_status_code(status_code)?;
        if !self.calls.contains(&call_id) {
            return Err(UaError::CallNotFound { call_id });
        }
        self.engine.answer_call(call_id, status_code).await.map_err(call_error)?;
        Ok(())
    }

    /// Terminate a call; `status_code` is used when rejecting an unanswered call
    pub async fn hangup_call(&self, call_id: CallId, status_code: Option<u16>) -> UaResult<()> {
        let running = self.running.lock().await;
        if running.is_none() {
            return Err(UaError::EngineNotRunning);
        }
        if let Some(code) = status_code {
            validate_status_code(code)?;
        }
        if !self.calls.contains(&call_id) {
            return Err(UaError::CallNotFound { call_id });
        }
        self.engine.hangup_call(call_id, status_code).await.map_err(call_error)?;
        Ok(())
    }

    pub fn call(&self, call_id: CallId) -> Option<CallInfo> {
        self.calls.get(&call_id)
    }

    pub fn calls(&self) -> Vec<CallInfo> {
        self.calls.list()
    }
}
