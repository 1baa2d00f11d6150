//! Event channel between the engine worker and the host observer
//!
//! The engine pushes events into an [`EventSink`]; a bounded tokio queue
//! carries them to a single dispatcher task, which folds each event into the
//! account and call tables and then hands it to the observer. One queue per
//! running user agent gives a total order over all events, so events for the
//! same account are always seen in the order the engine produced them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::call::CallRegistry;
use crate::error::{UaError, UaResult};
use crate::events::{EventKind, EventObserver, UaEvent};
use crate::registration::{AccountRegistry, TransitionOutcome};

/// Producer side of the event queue, handed to the engine
///
/// `emit` waits for queue capacity instead of dropping events. After
/// `stop` closes the queue every emit fails with
/// [`UaError::EventChannelClosed`].
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<UaEvent>,
}

impl EventSink {
    /// Enqueue an event, waiting while the queue is full
    pub async fn emit(&self, event: UaEvent) -> UaResult<()> {
        self.tx.send(event).await.map_err(|rejected| {
            debug!(kind = %rejected.0.kind(), "Event queue closed, discarding event");
            UaError::EventChannelClosed
        })
    }

    /// Enqueue from a thread outside the async runtime
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_emit(&self, event: UaEvent) -> UaResult<()> {
        self.tx.blocking_send(event).map_err(|rejected| {
            debug!(kind = %rejected.0.kind(), "Event queue closed, discarding event");
            UaError::EventChannelClosed
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots in the queue right now
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Create a bounded event queue
pub(crate) fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<UaEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink { tx }, rx)
}

/// Counters kept by the dispatcher across runs
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    observer_faults: AtomicU64,
    rejected_transitions: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub delivered: u64,
    pub observer_faults: u64,
    pub rejected_transitions: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            observer_faults: self.observer_faults.load(Ordering::Relaxed),
            rejected_transitions: self.rejected_transitions.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Dispatcher {
    rx: mpsc::Receiver<UaEvent>,
    observer: Arc<dyn EventObserver>,
    accounts: Arc<AccountRegistry>,
    calls: Arc<CallRegistry>,
    stats: Arc<DispatchStats>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(
        rx: mpsc::Receiver<UaEvent>,
        observer: Arc<dyn EventObserver>,
        accounts: Arc<AccountRegistry>,
        calls: Arc<CallRegistry>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            rx,
            observer,
            accounts,
            calls,
            stats,
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn spawn(self) -> DispatcherHandle {
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());
        DispatcherHandle { join, shutdown }
    }

    async fn run(mut self) {
        debug!("Event dispatcher started");
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(event) = self.rx.recv().await {
                        self.dispatch(event);
                        drained += 1;
                    }
                    debug!(drained, "Event queue closed and drained");
                    break;
                }
            }
        }
        debug!("Event dispatcher stopped");
    }

    fn dispatch(&self, event: UaEvent) {
        trace!(kind = %event.kind(), account_id = ?event.account_id(), "Dispatching event");
        self.apply(&event);
        self.deliver(&event);
    }

    fn apply(&self, event: &UaEvent) {
        match event {
            UaEvent::RegistrationStateChanged(info) => match self.accounts.apply(info) {
                TransitionOutcome::Applied { previous } => {
                    debug!(account_id = %info.account_id, from = %previous, to = %info.state, "Registration state changed");
                }
                TransitionOutcome::Rejected { from, to } => {
                    self.stats.rejected_transitions.fetch_add(1, Ordering::Relaxed);
                    warn!(account_id = %info.account_id, %from, %to, "Ignoring illegal registration transition");
                }
                TransitionOutcome::UnknownAccount => {
                    debug!(account_id = %info.account_id, "Registration event for unknown account");
                }
                TransitionOutcome::Unchanged => {}
            },
            UaEvent::EngineError { account_id, message } => {
                error!(account_id = ?account_id, "Engine error: {}", message);
            }
            other => self.calls.apply(other),
        }
    }

    fn deliver(&self, event: &UaEvent) {
        let kind = event.kind();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.observer.on_event(kind, event)));
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);

        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("observer panicked: {}", panic_message(payload.as_ref())),
        };
        self.stats.observer_faults.fetch_add(1, Ordering::Relaxed);
        error!(%kind, "Observer failed: {}", message);

        if kind != EventKind::ObserverError {
            self.deliver(&UaEvent::ObserverError { kind, message });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) struct DispatcherHandle {
    join: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl DispatcherHandle {
    /// Close the queue, drain it and wait for the task; false on timeout
    pub(crate) async fn shutdown(mut self, grace: Duration) -> bool {
        self.shutdown.cancel();
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Event dispatcher task failed: {}", e);
                true
            }
            Err(_) => {
                warn!("Event dispatcher did not drain within {:?}, aborting", grace);
                self.join.abort();
                false
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.shutdown.cancel();
    }
}
