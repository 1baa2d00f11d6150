//! In-process engine that answers its own requests
//!
//! `LoopbackEngine` binds a real signaling socket on `init` (so port
//! conflicts surface exactly as with a real stack) but never sends SIP.
//! Registrations are answered by a scripted registrar and outgoing calls by a
//! scripted peer, both configured through [`LoopbackBehavior`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{EngineError, SipEngine};
use crate::call::{CallId, CallInfo, CallRole, CallState, MediaStatus};
use crate::config::{TransportConfig, TransportProtocol};
use crate::dispatch::EventSink;
use crate::events::{RegistrationInfo, UaEvent};
use crate::registration::{AccountId, AccountParams, RegistrationState};

/// How the scripted registrar answers a REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarResponse {
    /// 200 OK; `expires` overrides the requested lifetime
    Accept { expires: Option<u32> },
    /// Final error response
    Reject { code: u16, reason: String },
    /// Never answer; the account stays `Registering`
    NoResponse,
}

impl Default for RegistrarResponse {
    fn default() -> Self {
        RegistrarResponse::Accept { expires: None }
    }
}

/// Script for the loopback registrar and peer
#[derive(Debug, Clone, Default)]
pub struct LoopbackBehavior {
    /// Default registrar answer
    pub registrar: RegistrarResponse,
    /// Per-gateway answers, keyed by the gateway as written (`host[:port]`)
    pub gateway_responses: HashMap<String, RegistrarResponse>,
    /// Delay before every scripted response
    pub response_delay: Duration,
    /// Whether outgoing calls are answered with 180 then 200
    pub answer_outgoing_calls: bool,
    /// Never confirm deregistrations
    pub ignore_deregistration: bool,
    /// Keep the worker alive after its shutdown token is cancelled
    pub ignore_shutdown_signal: bool,
    /// Fail `init` with this message
    pub fail_init: Option<String>,
    /// Refuse every `register_account` call synchronously with this reason
    pub refuse_accounts: Option<String>,
}

impl LoopbackBehavior {
    pub fn new() -> Self {
        Self {
            answer_outgoing_calls: true,
            ..Default::default()
        }
    }

    pub fn with_registrar(mut self, response: RegistrarResponse) -> Self {
        self.registrar = response;
        self
    }

    pub fn with_gateway_response(mut self, gateway: impl Into<String>, response: RegistrarResponse) -> Self {
        self.gateway_responses.insert(gateway.into(), response);
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_answer_outgoing_calls(mut self, answer: bool) -> Self {
        self.answer_outgoing_calls = answer;
        self
    }

    pub fn with_ignore_deregistration(mut self) -> Self {
        self.ignore_deregistration = true;
        self
    }

    pub fn with_ignore_shutdown_signal(mut self) -> Self {
        self.ignore_shutdown_signal = true;
        self
    }

    pub fn with_init_failure(mut self, message: impl Into<String>) -> Self {
        self.fail_init = Some(message.into());
        self
    }

    pub fn with_refused_accounts(mut self, reason: impl Into<String>) -> Self {
        self.refuse_accounts = Some(reason.into());
        self
    }

    fn response_for(&self, params: &AccountParams) -> RegistrarResponse {
        self.gateway_responses
            .get(&params.gateway.to_string())
            .cloned()
            .unwrap_or_else(|| self.registrar.clone())
    }
}

enum Command {
    Register { id: AccountId, params: AccountParams },
    Deregister { id: AccountId },
    Dial { call: CallInfo },
    Answer { call_id: CallId, code: u16 },
    Hangup { call_id: CallId, code: Option<u16> },
    Incoming { call: CallInfo },
    Inject(UaEvent),
}

enum BoundTransport {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

impl BoundTransport {
    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            BoundTransport::Udp(socket) => socket.local_addr(),
            BoundTransport::Tcp(listener) => listener.local_addr(),
        }
    }
}

/// Scripted in-process SIP engine
pub struct LoopbackEngine {
    behavior: RwLock<LoopbackBehavior>,
    sink: RwLock<Option<EventSink>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    transport: Mutex<Option<BoundTransport>>,
    local_addr: RwLock<Option<SocketAddr>>,
    accounts: DashMap<AccountId, AccountParams>,
    calls: DashMap<CallId, CallInfo>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::with_behavior(LoopbackBehavior::new())
    }

    pub fn with_behavior(behavior: LoopbackBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            sink: RwLock::new(None),
            commands: Mutex::new(None),
            command_rx: Mutex::new(None),
            transport: Mutex::new(None),
            local_addr: RwLock::new(None),
            accounts: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    /// Replace the script; takes effect for the next command handled
    pub fn set_behavior(&self, behavior: LoopbackBehavior) {
        *self.behavior.write() = behavior;
    }

    pub fn behavior(&self) -> LoopbackBehavior {
        self.behavior.read().clone()
    }

    /// Address the signaling transport is bound to, while initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// The sink installed by the user agent, while running
    pub fn event_sink(&self) -> Option<EventSink> {
        self.sink.read().clone()
    }

    /// Simulate an INVITE from `from_uri` to one of our accounts
    pub fn inject_incoming_call(&self, account_id: AccountId, from_uri: &str) -> Result<CallId, EngineError> {
        let uri = self
            .accounts
            .get(&account_id)
            .map(|params| params.uri())
            .ok_or_else(|| EngineError::rejected(format!("unknown account {}", account_id)))?;

        let mut call = CallInfo::new(CallRole::Uas, account_id, uri, from_uri)
            .with_state(CallState::Incoming, None);
        call.remote_contact = Some(format!("<{}>", from_uri));
        let call_id = call.id;
        self.calls.insert(call_id, call.clone());
        self.send(Command::Incoming { call })?;
        Ok(call_id)
    }

    /// Push an arbitrary event through the worker, as if the stack had raised it
    pub fn inject_event(&self, event: UaEvent) -> Result<(), EngineError> {
        self.send(Command::Inject(event))
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        let guard = self.commands.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| EngineError::internal("loopback engine is not initialized"))?;
        tx.send(command)
            .map_err(|_| EngineError::internal("loopback worker has stopped"))
    }

    async fn emit(&self, event: UaEvent) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => {
                let kind = event.kind();
                if let Err(e) = sink.emit(event).await {
                    debug!(%kind, "Discarding engine event: {}", e);
                }
            }
            None => debug!("No event sink installed, discarding {}", event.kind()),
        }
    }

    /// Wait for the scripted response delay; false if shutdown interrupted it
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        let delay = self.behavior.read().response_delay;
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    async fn update_call(&self, call: &mut CallInfo, state: CallState, status: Option<(u16, &str)>) {
        call.transition(state, status);
        if state.is_terminated() {
            self.calls.remove(&call.id);
        } else {
            self.calls.insert(call.id, call.clone());
        }
        self.emit(UaEvent::CallStateChanged { call: call.clone() }).await;
    }

    async fn start_media(&self, call: &mut CallInfo) {
        call.media_status = MediaStatus::Active;
        self.calls.insert(call.id, call.clone());
        self.emit(UaEvent::MediaStateChanged { call: call.clone() }).await;
        self.emit(UaEvent::StreamCreated {
            call: call.clone(),
            stream_index: 0,
        })
        .await;
    }

    async fn handle(&self, command: Command, shutdown: &CancellationToken) {
        match command {
            Command::Register { id, params } => {
                let response = self.behavior.read().response_for(&params);
                if !self.pause(shutdown).await {
                    return;
                }
                let info = RegistrationInfo::new(id, params.user.clone(), params.uri(), RegistrationState::Registered);
                match response {
                    RegistrarResponse::Accept { expires } => {
                        let info = info
                            .with_status(200, "OK")
                            .with_expires(expires.unwrap_or(params.expires));
                        self.emit(UaEvent::RegistrationStateChanged(info)).await;
                    }
                    RegistrarResponse::Reject { code, reason } => {
                        let info = RegistrationInfo {
                            state: RegistrationState::Failed,
                            ..info
                        }
                        .with_status(code, reason);
                        self.emit(UaEvent::RegistrationStateChanged(info)).await;
                    }
                    RegistrarResponse::NoResponse => {
                        debug!(account_id = %id, "Registrar stays silent");
                    }
                }
            }
            Command::Deregister { id } => {
                if self.behavior.read().ignore_deregistration {
                    debug!(account_id = %id, "Ignoring deregistration");
                    return;
                }
                let Some((_, params)) = self.accounts.remove(&id) else {
                    debug!(account_id = %id, "Deregistration for unknown account");
                    return;
                };
                if !self.pause(shutdown).await {
                    return;
                }
                let info = RegistrationInfo::new(id, params.user.clone(), params.uri(), RegistrationState::Unregistered)
                    .with_status(200, "OK")
                    .with_expires(0);
                self.emit(UaEvent::RegistrationStateChanged(info)).await;
            }
            Command::Dial { mut call } => {
                self.emit(UaEvent::CallStateChanged { call: call.clone() }).await;
                if !self.behavior.read().answer_outgoing_calls {
                    return;
                }
                if !self.pause(shutdown).await {
                    return;
                }
                self.update_call(&mut call, CallState::Early, Some((180, "Ringing"))).await;
                self.update_call(&mut call, CallState::Connecting, Some((200, "OK"))).await;
                self.update_call(&mut call, CallState::Confirmed, Some((200, "OK"))).await;
                self.start_media(&mut call).await;
            }
            Command::Answer { call_id, code } => {
                let Some(mut call) = self.calls.get(&call_id).map(|c| c.clone()) else {
                    self.emit(UaEvent::EngineError {
                        account_id: None,
                        message: format!("answer for unknown call {}", call_id),
                    })
                    .await;
                    return;
                };
                let text = reason_phrase(code);
                match code {
                    100..=199 => self.update_call(&mut call, CallState::Early, Some((code, text))).await,
                    200..=299 => {
                        self.update_call(&mut call, CallState::Connecting, Some((code, text))).await;
                        self.update_call(&mut call, CallState::Confirmed, Some((code, text))).await;
                        self.start_media(&mut call).await;
                    }
                    _ => self.update_call(&mut call, CallState::Disconnected, Some((code, text))).await,
                }
            }
            Command::Hangup { call_id, code } => {
                let Some(mut call) = self.calls.get(&call_id).map(|c| c.clone()) else {
                    trace!(%call_id, "Hangup for call already gone");
                    return;
                };
                if call.media_status == MediaStatus::Active {
                    call.media_status = MediaStatus::None;
                    self.emit(UaEvent::StreamDestroyed {
                        call: call.clone(),
                        stream_index: 0,
                    })
                    .await;
                }
                let code = code.unwrap_or(match call.state {
                    CallState::Confirmed | CallState::Connecting => 200,
                    CallState::Incoming | CallState::Early if call.role == CallRole::Uas => 603,
                    _ => 487,
                });
                self.update_call(&mut call, CallState::Disconnected, Some((code, reason_phrase(code))))
                    .await;
            }
            Command::Incoming { call } => {
                self.emit(UaEvent::IncomingCall {
                    account_id: call.account_id,
                    call: call.clone(),
                })
                .await;
                self.emit(UaEvent::CallStateChanged { call }).await;
            }
            Command::Inject(event) => self.emit(event).await,
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackEngine")
            .field("local_addr", &self.local_addr())
            .field("accounts", &self.accounts.len())
            .field("calls", &self.calls.len())
            .finish()
    }
}

#[async_trait]
impl SipEngine for LoopbackEngine {
    async fn init(&self, transport: &TransportConfig) -> Result<(), EngineError> {
        let addr = transport.bind_addr;
        let forced_failure = self.behavior.read().fail_init.clone();
        if let Some(message) = forced_failure {
            return Err(EngineError::TransportBind {
                addr: addr.to_string(),
                message,
            });
        }

        let bind_error = |e: std::io::Error| EngineError::TransportBind {
            addr: addr.to_string(),
            message: e.to_string(),
        };
        let bound = match transport.protocol {
            TransportProtocol::Udp => BoundTransport::Udp(UdpSocket::bind(addr).await.map_err(bind_error)?),
            TransportProtocol::Tcp => BoundTransport::Tcp(TcpListener::bind(addr).await.map_err(bind_error)?),
        };
        let local = bound.local_addr().map_err(bind_error)?;
        info!("Loopback engine bound {} transport on {}", transport.protocol, local);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.transport.lock() = Some(bound);
        *self.commands.lock() = Some(tx);
        *self.command_rx.lock() = Some(rx);
        *self.local_addr.write() = Some(local);
        Ok(())
    }

    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.write() = Some(sink);
    }

    async fn run(&self, shutdown: CancellationToken) {
        let receiver = self.command_rx.lock().take();
        let Some(mut commands) = receiver else {
            warn!("Loopback worker started before init");
            return;
        };
        let ignore_shutdown = self.behavior.read().ignore_shutdown_signal;
        debug!("Loopback worker running");

        if ignore_shutdown {
            let never = CancellationToken::new();
            while let Some(command) = commands.recv().await {
                self.handle(command, &never).await;
            }
            futures::future::pending::<()>().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command, &shutdown).await,
                    None => break,
                },
            }
        }
        debug!("Loopback worker stopped");
    }

    async fn register_account(&self, id: AccountId, params: &AccountParams) -> Result<(), EngineError> {
        let refusal = self.behavior.read().refuse_accounts.clone();
        if let Some(reason) = refusal {
            return Err(EngineError::rejected(reason));
        }
        debug!(account_id = %id, registrar = %params.registrar_uri(), realm = %params.realm(), "REGISTER");
        self.accounts.insert(id, params.clone());
        let sent = self.send(Command::Register {
            id,
            params: params.clone(),
        });
        if sent.is_err() {
            self.accounts.remove(&id);
        }
        sent
    }

    async fn deregister_account(&self, id: AccountId) {
        if let Err(e) = self.send(Command::Deregister { id }) {
            warn!(account_id = %id, "Cannot deregister: {}", e);
        }
    }

    async fn make_call(&self, call: &CallInfo) -> Result<(), EngineError> {
        let user = self
            .accounts
            .get(&call.account_id)
            .map(|params| params.user.clone())
            .ok_or_else(|| EngineError::rejected(format!("unknown account {}", call.account_id)))?;

        let mut call = call.clone();
        if let Some(addr) = self.local_addr() {
            call.local_contact = Some(format!("<sip:{}@{}>", user, addr));
        }
        self.calls.insert(call.id, call.clone());
        if let Err(e) = self.send(Command::Dial { call: call.clone() }) {
            self.calls.remove(&call.id);
            return Err(e);
        }
        Ok(())
    }

    async fn answer_call(&self, call_id: CallId, status_code: u16) -> Result<(), EngineError> {
        if !self.calls.contains_key(&call_id) {
            return Err(EngineError::rejected(format!("unknown call {}", call_id)));
        }
        self.send(Command::Answer {
            call_id,
            code: status_code,
        })
    }

    async fn hangup_call(&self, call_id: CallId, status_code: Option<u16>) -> Result<(), EngineError> {
        if !self.calls.contains_key(&call_id) {
            return Err(EngineError::rejected(format!("unknown call {}", call_id)));
        }
        self.send(Command::Hangup {
            call_id,
            code: status_code,
        })
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let transport = self.transport.lock().take();
        self.commands.lock().take();
        self.command_rx.lock().take();
        self.sink.write().take();
        self.local_addr.write().take();
        self.accounts.clear();
        self.calls.clear();
        if transport.is_some() {
            info!("Loopback engine transport released");
        }
        Ok(())
    }
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        180 => "Ringing",
        183 => "Session Progress",
        100..=199 => "Trying",
        200 => "OK",
        200..=299 => "Accepted",
        404 => "Not Found",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => "Call Terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::event_channel;

    fn local_udp() -> TransportConfig {
        TransportConfig {
            protocol: TransportProtocol::Udp,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn init_binds_an_ephemeral_port() {
        let engine = LoopbackEngine::new();
        engine.init(&local_udp()).await.unwrap();
        let addr = engine.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        engine.shutdown().await.unwrap();
        assert!(engine.local_addr().is_none());
    }

    #[tokio::test]
    async fn init_reports_port_conflicts() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig {
            protocol: TransportProtocol::Udp,
            bind_addr: taken.local_addr().unwrap(),
        };
        let err = LoopbackEngine::new().init(&config).await.unwrap_err();
        assert!(matches!(err, EngineError::TransportBind { .. }));
    }

    #[tokio::test]
    async fn registrar_answers_per_gateway() {
        let behavior = LoopbackBehavior::new().with_gateway_response(
            "blocked.example.com",
            RegistrarResponse::Reject {
                code: 403,
                reason: "Forbidden".into(),
            },
        );
        let engine = std::sync::Arc::new(LoopbackEngine::with_behavior(behavior));
        engine.init(&local_udp()).await.unwrap();
        let (sink, mut rx) = event_channel(16);
        engine.set_event_sink(sink);

        let token = CancellationToken::new();
        let worker = {
            let engine = engine.clone();
            let token = token.clone();
            tokio::spawn(async move { engine.run(token).await })
        };

        let ok = AccountParams::new("alice", "sip.example.com", "pw").unwrap();
        let blocked = AccountParams::new("bob", "blocked.example.com", "pw").unwrap();
        let (ok_id, blocked_id) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        engine.register_account(ok_id, &ok).await.unwrap();
        engine.register_account(blocked_id, &blocked).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.registration().unwrap().state, RegistrationState::Registered);
        assert_eq!(first.account_id(), Some(ok_id));
        let rejected = second.registration().unwrap();
        assert_eq!(rejected.state, RegistrationState::Failed);
        assert_eq!(rejected.status_code, Some(403));

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn refused_accounts_fail_synchronously() {
        let engine = LoopbackEngine::with_behavior(LoopbackBehavior::new().with_refused_accounts("no realm"));
        engine.init(&local_udp()).await.unwrap();
        let params = AccountParams::new("alice", "sip.example.com", "pw").unwrap();
        let err = engine.register_account(uuid::Uuid::new_v4(), &params).await.unwrap_err();
        assert_eq!(err, EngineError::rejected("no realm"));
    }

    #[tokio::test]
    async fn commands_before_init_are_rejected() {
        let engine = LoopbackEngine::new();
        let err = engine.inject_event(UaEvent::EngineError {
            account_id: None,
            message: "x".into(),
        });
        assert!(matches!(err, Err(EngineError::Internal { .. })));
    }
}
