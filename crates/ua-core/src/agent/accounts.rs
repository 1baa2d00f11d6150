//! Account operations on the user agent

use std::time::Duration;

use tracing::{info, warn};

use super::UserAgent;
use crate::error::{UaError, UaResult};
use crate::events::{RegistrationInfo, UaEvent};
use crate::registration::{Account, AccountId, AccountParams, RegistrationState, RegistrationStats};

impl UserAgent {
    /// Create an account and start registering it with `gateway`
    ///
    /// Returns as soon as the request is handed to the engine. The outcome is
    /// delivered as a `RegistrationStateChanged` event (`Registered` or
    /// `Failed`), preceded by one for `Registering`.
    ///
    /// # Errors
    ///
    /// - [`UaError::EngineNotRunning`] before `start` or after `stop`
    /// - [`UaError::InvalidAccountParams`] for a malformed user or gateway,
    ///   or when the engine refuses the account outright
    /// - [`UaError::Engine`] when the engine cannot take the request at all,
    ///   for example because its worker is gone
    ///
    /// Once the engine has been asked, a refusal is also reported as
    /// `Registering` followed by `Failed`, and no account record remains.
    /// - [`UaError::DuplicateAccount`] when the same address of record is
    ///   already registering or registered
    pub async fn add_account(&self, user: &str, gateway: &str, password: &str) -> UaResult<AccountId> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(UaError::EngineNotRunning)?;

        let params = AccountParams::new(user, gateway, password)?
            .with_expires(self.config.registration_expires);
        let account = self.accounts.begin_registration(&params)?;
        info!(account_id = %account.id, uri = %account.uri, "Registering account");

        let registering = RegistrationInfo::new(
            account.id,
            account.user.clone(),
            account.uri.clone(),
            RegistrationState::Registering,
        );
        running
            .sink
            .emit(UaEvent::RegistrationStateChanged(registering))
            .await?;

        if let Err(e) = self.engine.register_account(account.id, &params).await {
            warn!(account_id = %account.id, "Engine refused account: {}", e);
            self.accounts.remove(&account.id);
            let failed = RegistrationInfo::new(
                account.id,
                account.user.clone(),
                account.uri.clone(),
                RegistrationState::Failed,
            )
            .with_reason(e.to_string());
            if running.sink.emit(UaEvent::RegistrationStateChanged(failed)).await.is_err() {
                warn!(account_id = %account.id, "Could not report refused account");
            }
            return Err(e.into());
        }

        Ok(account.id)
    }

    /// Wait until an account leaves `Registering`
    ///
    /// Returns the account's state at that point, or `Registering` if
    /// `timeout` elapsed first. An account removed while waiting (for example
    /// by `stop`) reads as `Unregistered`.
    pub async fn wait_for_registration(&self, id: AccountId, timeout: Duration) -> UaResult<RegistrationState> {
        if self.accounts.state_of(&id).is_none() {
            return Err(UaError::AccountNotFound { account_id: id });
        }
        self.accounts
            .wait_until(
                |registry| registry.state_of(&id) != Some(RegistrationState::Registering),
                timeout,
            )
            .await;
        Ok(self
            .accounts
            .state_of(&id)
            .unwrap_or(RegistrationState::Unregistered))
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.list()
    }

    pub fn account_state(&self, id: AccountId) -> Option<RegistrationState> {
        self.accounts.state_of(&id)
    }

    pub fn registration_stats(&self) -> RegistrationStats {
        self.accounts.stats()
    }
}
