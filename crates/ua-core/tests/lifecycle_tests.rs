//! Engine lifecycle: start, stop, restart and failure handling

mod common;

use std::time::Duration;

use common::*;
use serial_test::serial;
use sipua_core::{EngineState, LoopbackBehavior, RegistrationState, UaError};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn add_account_before_start_is_rejected() {
    let (agent, _) = agent_with(LoopbackBehavior::new());
    let err = agent.add_account("alice", "sip.example.com", "pw").await.unwrap_err();
    assert!(matches!(err, UaError::EngineNotRunning));
    assert!(agent.accounts().is_empty());
}

#[tokio::test]
async fn engine_state_error_wins_over_validation() {
    let (agent, _) = agent_with(LoopbackBehavior::new());
    let err = agent.add_account("", "not a valid host", "").await.unwrap_err();
    assert!(matches!(err, UaError::EngineNotRunning));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (agent, _) = agent_with(LoopbackBehavior::new());
    assert_ok!(agent.stop().await);
    assert_eq!(agent.state(), EngineState::Uninitialized);

    let (recorder, _rx) = Recorder::new();
    agent.start(recorder).await.unwrap();
    assert_ok!(agent.stop().await);
    assert_ok!(agent.stop().await);
    assert_eq!(agent.state(), EngineState::Stopped);
}

#[tokio::test]
async fn happy_path_register_and_stop() {
    let (agent, _) = agent_with(LoopbackBehavior::new());
    let (recorder, mut rx) = Recorder::new();
    agent.start(recorder.clone()).await.unwrap();

    let id = agent.add_account("alice", "sip.example.com", "secret").await.unwrap();
    wait_for(&mut rx, |event| {
        event.registration().map(|info| info.state) == Some(RegistrationState::Registered)
    })
    .await;
    assert_eq!(agent.account_state(id), Some(RegistrationState::Registered));

    assert_ok!(agent.stop().await);
    let delivered = recorder.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.len(), delivered, "events delivered after stop returned");

    let states = recorder.registration_states("sip:alice@sip.example.com");
    assert_eq!(
        states,
        vec![
            RegistrationState::Registering,
            RegistrationState::Registered,
            RegistrationState::Unregistered,
        ]
    );
}

#[tokio::test]
async fn restart_delivers_to_new_observer_only() {
    let (agent, _) = agent_with(LoopbackBehavior::new());
    let (first, _rx1) = Recorder::new();
    agent.start(first.clone()).await.unwrap();
    agent.stop().await.unwrap();
    let first_count = first.len();

    let (second, mut rx2) = Recorder::new();
    agent.start(second.clone()).await.unwrap();
    agent.add_account("bob", "sip.example.com", "pw").await.unwrap();
    wait_for(&mut rx2, |event| {
        event.registration().map(|info| info.state) == Some(RegistrationState::Registered)
    })
    .await;
    agent.stop().await.unwrap();

    assert_eq!(first.len(), first_count);
    assert!(second.len() >= 2);
}

#[tokio::test]
#[serial]
async fn start_fails_on_taken_port_and_recovers() {
    let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = blocker.local_addr().unwrap();

    let (agent, _) = agent_with(LoopbackBehavior::new());
    let agent_on_port = sipua_core::UserAgent::new(
        std::sync::Arc::new(sipua_core::LoopbackEngine::new()),
        local_config().with_bind_addr(addr),
    );
    let (recorder, _rx) = Recorder::new();

    let err = assert_err!(agent_on_port.start(recorder.clone()).await);
    assert!(matches!(err, UaError::EngineInit { .. }), "{err:?}");
    assert_eq!(agent_on_port.state(), EngineState::Uninitialized);

    drop(blocker);
    assert_ok!(agent_on_port.start(recorder.clone()).await);
    assert!(agent_on_port.is_running());
    agent_on_port.stop().await.unwrap();

    // an unrelated handle on an ephemeral port is unaffected
    assert_ok!(agent.start(recorder).await);
    agent.stop().await.unwrap();
}

#[tokio::test]
async fn independent_handles_run_side_by_side() {
    let (a, _) = agent_with(LoopbackBehavior::new());
    let (b, _) = agent_with(LoopbackBehavior::new());
    let (ra, _rxa) = Recorder::new();
    let (rb, _rxb) = Recorder::new();

    a.start(ra).await.unwrap();
    b.start(rb).await.unwrap();
    assert!(a.is_running() && b.is_running());

    a.stop().await.unwrap();
    assert!(b.is_running());
    b.stop().await.unwrap();
}
