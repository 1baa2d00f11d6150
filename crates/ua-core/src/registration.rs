//! Accounts and their registration state
//!
//! An account is a set of credentials plus the gateway it registers against.
//! Accounts are created by [`UserAgent::add_account`](crate::UserAgent::add_account)
//! and afterwards change state only when the engine reports a registration
//! outcome on the event stream.
//!
//! # State Transitions
//!
//! ```text
//! Unregistered ──► Registering ──► Registered
//!       ▲              │   │            │
//!       │              │   └──► Failed ◄┘
//!       └──────────────┴─────────┴──────┘   (deregistration / reset)
//! ```
//!
//! A registered account may go back to `Registering` while the engine
//! refreshes the binding.
//!
//! # Examples
//!
//! ```rust
//! use sipua_core::registration::{AccountParams, RegistrationState};
//!
//! let params = AccountParams::new("alice", "sip.example.com:5080", "secret").unwrap();
//! assert_eq!(params.uri(), "sip:alice@sip.example.com:5080");
//! assert_eq!(params.registrar_uri(), "sip:sip.example.com:5080");
//! assert!(!format!("{:?}", params).contains("secret"));
//!
//! assert!(RegistrationState::Registering.can_transition_to(RegistrationState::Registered));
//! assert!(!RegistrationState::Unregistered.can_transition_to(RegistrationState::Registered));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{UaError, UaResult};
use crate::events::RegistrationInfo;

/// Identifier the core assigns to every account
pub type AccountId = Uuid;

/// Characters that may not appear in the user part of an address of record
const FORBIDDEN_USER_CHARS: &[char] = &['@', ':', ';', '<', '>', '"', '/', '?'];

/// Registration state of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegistrationState {
    /// No binding with the registrar
    Unregistered,
    /// REGISTER sent, outcome pending
    Registering,
    /// Registrar accepted the binding
    Registered,
    /// Registrar rejected the binding, timed out, or the network failed
    Failed,
}

impl RegistrationState {
    /// Whether a move from `self` to `next` is allowed
    ///
    /// Staying in the same state is always allowed and is treated as a no-op.
    pub fn can_transition_to(self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Registered)
                | (Registering, Failed)
                | (Registering, Unregistered)
                | (Registered, Registering)
                | (Registered, Unregistered)
                | (Registered, Failed)
                | (Failed, Unregistered)
        )
    }

    /// Registering or Registered; these need a deregistration on shutdown
    pub fn is_active(self) -> bool {
        matches!(self, RegistrationState::Registering | RegistrationState::Registered)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Unregistered => write!(f, "Unregistered"),
            RegistrationState::Registering => write!(f, "Registering"),
            RegistrationState::Registered => write!(f, "Registered"),
            RegistrationState::Failed => write!(f, "Failed"),
        }
    }
}

/// A credential secret
///
/// The value is only reachable through [`Secret::expose`]; `Debug` prints a
/// redaction marker and the type is never serialized.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plain secret, for handing to the engine's digest authentication
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// A registrar address: `host[:port]`
///
/// Hosts are DNS names, IPv4 literals or bracketed IPv6 literals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gateway {
    host: String,
    port: Option<u16>,
}

impl Gateway {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

impl Serialize for Gateway {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Gateway {
    type Err = UaError;

    fn from_str(input: &str) -> UaResult<Self> {
        if input.is_empty() {
            return Err(UaError::invalid_account("gateway must not be empty"));
        }
        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(UaError::invalid_account(format!(
                "gateway '{}' contains whitespace",
                input
            )));
        }

        let (host_part, port_part) = split_host_port(input)?;
        let port = match port_part {
            Some(raw) => Some(parse_port(raw)?),
            None => None,
        };

        let host = url::Host::parse(host_part)
            .map_err(|e| UaError::invalid_account(format!("gateway host '{}': {}", host_part, e)))?;
        if let url::Host::Domain(domain) = &host {
            validate_domain(domain)?;
        }

        Ok(Gateway {
            host: host.to_string(),
            port,
        })
    }
}

fn split_host_port(input: &str) -> UaResult<(&str, Option<&str>)> {
    if input.starts_with('[') {
        let end = input
            .find(']')
            .ok_or_else(|| UaError::invalid_account("unterminated IPv6 literal in gateway"))?;
        let (host, rest) = input.split_at(end + 1);
        return match rest {
            "" => Ok((host, None)),
            _ => match rest.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(UaError::invalid_account(format!(
                    "unexpected '{}' after IPv6 literal",
                    rest
                ))),
            },
        };
    }

    match input.split_once(':') {
        Some((host, port)) if !port.contains(':') => Ok((host, Some(port))),
        Some(_) => Err(UaError::invalid_account(
            "IPv6 gateways must be written in brackets",
        )),
        None => Ok((input, None)),
    }
}

fn parse_port(raw: &str) -> UaResult<u16> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(UaError::invalid_account(format!(
            "gateway port '{}' is not in 1..=65535",
            raw
        ))),
        Ok(port) => Ok(port),
    }
}

fn validate_domain(domain: &str) -> UaResult<()> {
    if domain.len() > 253 {
        return Err(UaError::invalid_account("gateway host name is too long"));
    }
    for label in domain.trim_end_matches('.').split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(UaError::invalid_account(format!(
                "gateway host label '{}' is not a valid DNS label",
                label
            )));
        }
    }
    Ok(())
}

fn validate_user(user: &str) -> UaResult<()> {
    if user.is_empty() {
        return Err(UaError::invalid_account("user must not be empty"));
    }
    if user.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(UaError::invalid_account("user must not contain whitespace"));
    }
    if let Some(c) = user.chars().find(|c| FORBIDDEN_USER_CHARS.contains(c)) {
        return Err(UaError::invalid_account(format!(
            "user must not contain '{}'",
            c
        )));
    }
    Ok(())
}

/// Validated parameters for registering one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountParams {
    pub user: String,
    pub gateway: Gateway,
    pub password: Secret,
    /// Requested binding lifetime in seconds
    pub expires: u32,
}

impl AccountParams {
    /// Validate raw user, gateway and password values
    pub fn new(user: &str, gateway: &str, password: &str) -> UaResult<Self> {
        validate_user(user)?;
        let gateway = gateway.parse::<Gateway>()?;
        Ok(Self {
            user: user.to_string(),
            gateway,
            password: Secret::new(password),
            expires: 3600,
        })
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    /// Address of record, `sip:user@gateway`
    pub fn uri(&self) -> String {
        format!("sip:{}@{}", self.user, self.gateway)
    }

    /// Request-URI of the REGISTER, `sip:gateway`
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.gateway)
    }

    /// Digest realm; the gateway host
    pub fn realm(&self) -> &str {
        self.gateway.host()
    }
}

/// Snapshot of an account held by the registry
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub user: String,
    pub gateway: Gateway,
    #[serde(skip)]
    pub password: Secret,
    /// Address of record
    pub uri: String,
    pub state: RegistrationState,
    /// Last SIP status code reported for the registration
    pub last_status_code: Option<u16>,
    /// Last reason phrase or failure description
    pub last_reason: Option<String>,
    /// Binding lifetime granted by the registrar
    pub expires: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    fn from_params(params: &AccountParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user: params.user.clone(),
            gateway: params.gateway.clone(),
            password: params.password.clone(),
            uri: params.uri(),
            state: RegistrationState::Unregistered,
            last_status_code: None,
            last_reason: None,
            expires: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Aggregate counts over the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationStats {
    pub total: usize,
    pub registering: usize,
    pub registered: usize,
    pub failed: usize,
}

/// What happened when an engine-reported state was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { previous: RegistrationState },
    Unchanged,
    Rejected { from: RegistrationState, to: RegistrationState },
    UnknownAccount,
}

/// Accounts of one user agent, keyed by [`AccountId`]
///
/// Every state change bumps a generation counter so callers can wait for a
/// condition without polling.
pub struct AccountRegistry {
    accounts: DashMap<AccountId, Account>,
    generation: watch::Sender<u64>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            accounts: DashMap::new(),
            generation,
        }
    }

    /// Record a new account and move it straight to `Registering`
    ///
    /// An existing account with the same address of record is replaced when it
    /// is `Failed` or `Unregistered`; an active one is a duplicate.
    pub(crate) fn begin_registration(&self, params: &AccountParams) -> UaResult<Account> {
        let uri = params.uri();
        if let Some(existing) = self.find_by_uri(&uri) {
            if existing.state.is_active() {
                return Err(UaError::DuplicateAccount { uri });
            }
            tracing::debug!(account_id = %existing.id, %uri, "Replacing inactive account");
            self.accounts.remove(&existing.id);
        }

        let mut account = Account::from_params(params);
        account.state = RegistrationState::Registering;
        self.accounts.insert(account.id, account.clone());
        self.bump();
        Ok(account)
    }

    /// Apply a registration outcome reported by the engine
    pub(crate) fn apply(&self, info: &RegistrationInfo) -> TransitionOutcome {
        let outcome = match self.accounts.get_mut(&info.account_id) {
            None => TransitionOutcome::UnknownAccount,
            Some(mut account) => {
                let previous = account.state;
                if !previous.can_transition_to(info.state) {
                    TransitionOutcome::Rejected {
                        from: previous,
                        to: info.state,
                    }
                } else {
                    account.state = info.state;
                    if info.status_code.is_some() {
                        account.last_status_code = info.status_code;
                    }
                    if info.reason.is_some() {
                        account.last_reason = info.reason.clone();
                    }
                    if info.expires.is_some() {
                        account.expires = info.expires;
                    }
                    account.updated_at = info.timestamp;
                    if previous == info.state {
                        TransitionOutcome::Unchanged
                    } else {
                        TransitionOutcome::Applied { previous }
                    }
                }
            }
        };
        if matches!(outcome, TransitionOutcome::Applied { .. }) {
            self.bump();
        }
        outcome
    }

    pub fn get(&self, id: &AccountId) -> Option<Account> {
        self.accounts.get(id).map(|entry| entry.value().clone())
    }

    pub fn find_by_uri(&self, uri: &str) -> Option<Account> {
        self.accounts
            .iter()
            .find(|entry| entry.uri == uri)
            .map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by_key(|a| a.created_at);
        accounts
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn state_of(&self, id: &AccountId) -> Option<RegistrationState> {
        self.accounts.get(id).map(|entry| entry.state)
    }

    pub fn is_active(&self, id: &AccountId) -> bool {
        self.state_of(id).map(RegistrationState::is_active).unwrap_or(false)
    }

    /// Accounts that need a deregistration before shutdown
    pub fn active_ids(&self) -> Vec<AccountId> {
        self.accounts
            .iter()
            .filter(|entry| entry.state.is_active())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn stats(&self) -> RegistrationStats {
        let mut stats = RegistrationStats::default();
        for entry in self.accounts.iter() {
            stats.total += 1;
            match entry.state {
                RegistrationState::Registering => stats.registering += 1,
                RegistrationState::Registered => stats.registered += 1,
                RegistrationState::Failed => stats.failed += 1,
                RegistrationState::Unregistered => {}
            }
        }
        stats
    }

    pub(crate) fn remove(&self, id: &AccountId) -> Option<Account> {
        let removed = self.accounts.remove(id).map(|(_, account)| account);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Reset every account to `Unregistered` and drop it
    pub(crate) fn reset_all(&self) {
        for mut entry in self.accounts.iter_mut() {
            entry.state = RegistrationState::Unregistered;
            entry.updated_at = Utc::now();
        }
        self.bump();
        self.accounts.clear();
        self.bump();
    }

    /// Wait until `done` holds or `timeout` elapses; returns whether it held
    pub async fn wait_until<F>(&self, mut done: F, timeout: Duration) -> bool
    where
        F: FnMut(&AccountRegistry) -> bool,
    {
        let mut changes = self.generation.subscribe();
        let wait = async {
            loop {
                if done(self) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => done(self),
            Err(_) => false,
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRegistry")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(user: &str) -> AccountParams {
        AccountParams::new(user, "sip.example.com", "secret").unwrap()
    }

    #[test]
    fn accepts_common_gateway_forms() {
        for input in [
            "sip.example.com",
            "sip.example.com:5080",
            "localhost",
            "192.168.1.10",
            "192.168.1.10:5060",
            "[::1]",
            "[2001:db8::1]:5061",
        ] {
            assert!(input.parse::<Gateway>().is_ok(), "{input} should parse");
        }
    }

    #[test]
    fn rejects_malformed_gateways() {
        for input in [
            "",
            "not a valid host",
            "sip.example.com:",
            "sip.example.com:0",
            "sip.example.com:70000",
            "-bad.example.com",
            "under_score.example.com",
            "2001:db8::1",
            "[::1",
            "[::1]x",
            "user@sip.example.com",
        ] {
            let err = input.parse::<Gateway>().unwrap_err();
            assert!(
                matches!(err, UaError::InvalidAccountParams { .. }),
                "{input} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn gateway_display_keeps_port_and_brackets() {
        let gw: Gateway = "[2001:db8::1]:5061".parse().unwrap();
        assert_eq!(gw.to_string(), "[2001:db8::1]:5061");
        let gw: Gateway = "SIP.Example.com".parse().unwrap();
        assert_eq!(gw.host(), "sip.example.com");
        assert_eq!(gw.port(), None);
    }

    #[test]
    fn rejects_bad_users() {
        for user in ["", "al ice", "alice@home", "a:b", "<alice>"] {
            assert!(AccountParams::new(user, "sip.example.com", "pw").is_err(), "{user:?}");
        }
    }

    #[test]
    fn derived_uris_follow_gateway() {
        let p = params("alice");
        assert_eq!(p.uri(), "sip:alice@sip.example.com");
        assert_eq!(p.registrar_uri(), "sip:sip.example.com");
        assert_eq!(p.realm(), "sip.example.com");
    }

    #[test]
    fn secret_is_redacted_everywhere() {
        let registry = AccountRegistry::new();
        let account = registry.begin_registration(&params("alice")).unwrap();
        assert!(!format!("{:?}", account).contains("secret"));
        let json = serde_json::to_string(&account).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("password"));
        assert_eq!(account.password.expose(), "secret");
    }

    #[test]
    fn transition_table() {
        use RegistrationState::*;
        assert!(Unregistered.can_transition_to(Registering));
        assert!(Registering.can_transition_to(Registered));
        assert!(Registering.can_transition_to(Failed));
        assert!(Registered.can_transition_to(Unregistered));
        assert!(Failed.can_transition_to(Unregistered));
        assert!(Registered.can_transition_to(Registered));

        assert!(!Unregistered.can_transition_to(Registered));
        assert!(!Unregistered.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Registered));
        assert!(!Failed.can_transition_to(Registering));
    }

    #[test]
    fn begin_registration_enters_registering() {
        let registry = AccountRegistry::new();
        let account = registry.begin_registration(&params("alice")).unwrap();
        assert_eq!(account.state, RegistrationState::Registering);
        assert_eq!(registry.state_of(&account.id), Some(RegistrationState::Registering));
        assert_eq!(registry.active_ids(), vec![account.id]);
    }

    #[test]
    fn duplicate_active_account_is_rejected_but_failed_is_replaced() {
        let registry = AccountRegistry::new();
        let first = registry.begin_registration(&params("alice")).unwrap();

        let err = registry.begin_registration(&params("alice")).unwrap_err();
        assert!(matches!(err, UaError::DuplicateAccount { .. }));

        let failed = RegistrationInfo::new(first.id, &first.user, &first.uri, RegistrationState::Failed)
            .with_status(403, "Forbidden");
        assert_eq!(
            registry.apply(&failed),
            TransitionOutcome::Applied { previous: RegistrationState::Registering }
        );

        let second = registry.begin_registration(&params("alice")).unwrap();
        assert_ne!(first.id, second.id);
        assert!(registry.get(&first.id).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn illegal_transition_is_not_applied() {
        let registry = AccountRegistry::new();
        let account = registry.begin_registration(&params("bob")).unwrap();
        let failed = RegistrationInfo::new(account.id, "bob", &account.uri, RegistrationState::Failed);
        registry.apply(&failed);

        let registered = RegistrationInfo::new(account.id, "bob", &account.uri, RegistrationState::Registered);
        assert_eq!(
            registry.apply(&registered),
            TransitionOutcome::Rejected {
                from: RegistrationState::Failed,
                to: RegistrationState::Registered
            }
        );
        assert_eq!(registry.state_of(&account.id), Some(RegistrationState::Failed));
    }

    #[test]
    fn apply_records_status_details() {
        let registry = AccountRegistry::new();
        let account = registry.begin_registration(&params("carol")).unwrap();
        let ok = RegistrationInfo::new(account.id, "carol", &account.uri, RegistrationState::Registered)
            .with_status(200, "OK")
            .with_expires(600);
        registry.apply(&ok);

        let stored = registry.get(&account.id).unwrap();
        assert_eq!(stored.last_status_code, Some(200));
        assert_eq!(stored.last_reason.as_deref(), Some("OK"));
        assert_eq!(stored.expires, Some(600));

        let stats = registry.stats();
        assert_eq!(stats, RegistrationStats { total: 1, registering: 0, registered: 1, failed: 0 });
    }

    #[test]
    fn unknown_account_is_reported() {
        let registry = AccountRegistry::new();
        let info = RegistrationInfo::new(Uuid::new_v4(), "ghost", "sip:ghost@x", RegistrationState::Registered);
        assert_eq!(registry.apply(&info), TransitionOutcome::UnknownAccount);
    }

    #[tokio::test]
    async fn wait_until_wakes_on_change() {
        let registry = std::sync::Arc::new(AccountRegistry::new());
        let account = registry.begin_registration(&params("dave")).unwrap();

        let updater = registry.clone();
        let uri = account.uri.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            updater.apply(&RegistrationInfo::new(account.id, "dave", &uri, RegistrationState::Registered));
        });

        let reached = registry
            .wait_until(|r| r.state_of(&account.id) == Some(RegistrationState::Registered), Duration::from_secs(2))
            .await;
        assert!(reached);
    }

    #[tokio::test]
    async fn wait_until_times_out() {
        let registry = AccountRegistry::new();
        let account = registry.begin_registration(&params("erin")).unwrap();
        let reached = registry
            .wait_until(|r| !r.is_active(&account.id), Duration::from_millis(30))
            .await;
        assert!(!reached);
    }

    #[test]
    fn reset_all_clears_registry() {
        let registry = AccountRegistry::new();
        registry.begin_registration(&params("alice")).unwrap();
        registry.begin_registration(&params("bob")).unwrap();
        registry.reset_all();
        assert!(registry.is_empty());
        assert!(registry.active_ids().is_empty());
    }
}
