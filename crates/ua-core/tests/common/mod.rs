//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sipua_core::{
    EventKind, EventObserver, LoopbackBehavior, LoopbackEngine, RegistrationState, UaConfig, UaEvent, UserAgent,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn local_config() -> UaConfig {
    UaConfig::new()
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_deregistration_timeout(Duration::from_millis(500))
        .with_shutdown_grace(Duration::from_millis(500))
}

pub fn agent_with(behavior: LoopbackBehavior) -> (UserAgent, Arc<LoopbackEngine>) {
    let engine = Arc::new(LoopbackEngine::with_behavior(behavior));
    (UserAgent::new(engine.clone(), local_config()), engine)
}

/// Observer that records every delivery and forwards it to a channel
pub struct Recorder {
    seen: Mutex<Vec<(EventKind, UaEvent)>>,
    tx: mpsc::UnboundedSender<UaEvent>,
}

impl Recorder {
    pub fn new() -> (Arc<Recorder>, mpsc::UnboundedReceiver<UaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    pub fn events(&self) -> Vec<(EventKind, UaEvent)> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Registration states delivered for the account with this address of record
    pub fn registration_states(&self, uri: &str) -> Vec<RegistrationState> {
        self.seen
            .lock()
            .iter()
            .filter_map(|(_, event)| event.registration())
            .filter(|info| info.uri == uri)
            .map(|info| info.state)
            .collect()
    }
}

impl EventObserver for Recorder {
    fn on_event(&self, kind: EventKind, event: &UaEvent) -> anyhow::Result<()> {
        self.seen.lock().push((kind, event.clone()));
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<UaEvent>) -> UaEvent {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches `pred`
pub async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<UaEvent>, mut pred: F) -> UaEvent
where
    F: FnMut(&UaEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}
