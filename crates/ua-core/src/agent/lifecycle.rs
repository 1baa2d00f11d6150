//! Starting and stopping the engine

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EngineState, Running, UserAgent};
use crate::dispatch::{event_channel, Dispatcher};
use crate::error::{ShutdownPhase, UaError, UaResult};
use crate::events::EventObserver;

impl UserAgent {
    /// Initialize the engine and begin delivering events to `observer`
    ///
    /// Fails with [`UaError::AlreadyRunning`] if the engine is running and
    /// with [`UaError::EngineInit`] if the engine cannot bind its transport;
    /// in both cases the state is left unchanged and `start` may be retried.
    pub async fn start(&self, observer: Arc<dyn EventObserver>) -> UaResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(UaError::AlreadyRunning);
        }

        let transport = &self.config.transport;
        info!(protocol = %transport.protocol, addr = %transport.bind_addr, "Starting SIP engine");
        if let Err(e) = self.engine.init(transport).await {
            error!("SIP engine failed to initialize: {}", e);
            return Err(UaError::engine_init(e.to_string()));
        }

        self.accounts.reset_all();
        self.calls.clear();

        let (sink, rx) = event_channel(self.config.event_queue_capacity);
        self.engine.set_event_sink(sink.clone());

        let dispatcher = Dispatcher::new(
            rx,
            observer,
            self.accounts.clone(),
            self.calls.clone(),
            self.dispatch_stats.clone(),
        )
        .spawn();

        let worker_token = CancellationToken::new();
        let worker = {
            let engine = self.engine.clone();
            let token = worker_token.clone();
            tokio::spawn(async move {
                engine.run(token).await;
                debug!("Engine worker exited");
            })
        };

        *running = Some(Running {
            sink,
            worker,
            worker_token,
            dispatcher,
        });
        self.set_state(EngineState::Running);
        Ok(())
    }

    /// Deregister accounts, halt the engine and release the observer
    ///
    /// Calling `stop` when the engine is not running returns `Ok(())`.
    /// Every wait is bounded; if one runs out of time the remaining steps
    /// still run, the handle ends up `Stopped`, and the first expiry is
    /// returned as [`UaError::ShutdownTimeout`]. No event reaches the observer
    /// after `stop` returns.
    pub async fn stop(&self) -> UaResult<()> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.take() else {
            debug!("stop called while engine is not running");
            return Ok(());
        };
        info!("Stopping SIP engine");

        let grace = self.config.shutdown_grace();
        let mut first_error: Option<UaError> = None;

        let active = self.accounts.active_ids();
        if !active.is_empty() {
            info!(accounts = active.len(), "Deregistering accounts");
            for id in &active {
                self.engine.deregister_account(*id).await;
            }
            let timeout = self.config.deregistration_timeout();
            let done = self
                .accounts
                .wait_until(|registry| active.iter().all(|id| !registry.is_active(id)), timeout)
                .await;
            if !done {
                warn!("Deregistration did not complete within {:?}", timeout);
                first_error.get_or_insert(UaError::ShutdownTimeout {
                    phase: ShutdownPhase::Deregistration,
                    grace: timeout,
                });
            }
        }

        running.worker_token.cancel();
        let mut worker = running.worker;
        match tokio::time::timeout(grace, &mut worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Engine worker task failed: {}", e),
            Err(_) => {
                warn!("Engine worker did not halt within {:?}, aborting", grace);
                worker.abort();
                first_error.get_or_insert(UaError::ShutdownTimeout {
                    phase: ShutdownPhase::Worker,
                    grace,
                });
            }
        }

        match tokio::time::timeout(grace, self.engine.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Engine shutdown failed: {}", e);
                first_error.get_or_insert(UaError::from(e));
            }
            Err(_) => {
                warn!("Engine shutdown did not finish within {:?}", grace);
                first_error.get_or_insert(UaError::ShutdownTimeout {
                    phase: ShutdownPhase::Engine,
                    grace,
                });
            }
        }

        drop(running.sink);
        if !running.dispatcher.shutdown(grace).await {
            first_error.get_or_insert(UaError::ShutdownTimeout {
                phase: ShutdownPhase::Dispatcher,
                grace,
            });
        }

        self.accounts.reset_all();
        self.calls.clear();
        self.set_state(EngineState::Stopped);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
