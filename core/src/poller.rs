//! Incoming-call poller
//!
//! Fallback for missed push events: asks the backend for undelivered calls on
//! a fixed schedule and feeds the first unseen one to the presenter.

use crate::models::{Call, CallId};
use crate::network::Backend;
use crate::presenter::{CallPresenter, CallSource};
use crate::session::SessionGuard;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct IncomingCallPoller {
    backend: Arc<dyn Backend>,
    presenter: CallPresenter,
    guard: SessionGuard,
    interval: Duration,
}

/// Stops the poller when told to or when dropped.
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl IncomingCallPoller {
    pub fn new(
        backend: Arc<dyn Backend>,
        presenter: CallPresenter,
        guard: SessionGuard,
        interval: Duration,
    ) -> Self {
        Self {
            backend,
            presenter,
            guard,
            interval,
        }
    }

    /// First poll fires immediately, then every `interval`.
    pub fn spawn(self, cancel: CancellationToken) -> PollerHandle {
        let task = tokio::spawn(self.run(cancel.clone()));
        PollerHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let calls = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.backend.incoming_calls() => r,
            };

            match calls {
                Ok(calls) => self.surface_first_unseen(calls, &cancel),
                Err(e) if e.is_unauthorized() => {
                    self.guard.invalidate();
                    tracing::warn!("Incoming call polling stopped: session unauthorized");
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "Incoming call poll failed"),
            }
        }

        tracing::debug!("Incoming call poller stopped");
    }

    fn surface_first_unseen(&self, calls: Vec<Call>, cancel: &CancellationToken) {
        let admitted = calls
            .into_iter()
            .find(|call| self.presenter.offer(call.clone(), CallSource::Poll));

        if let Some(call) = admitted {
            acknowledge(self.backend.clone(), call.id, cancel.clone());
        }
    }
}

/// Fire-and-forget delivery acknowledgement. A lost ack only means the call may
/// be listed again, which the seen store absorbs.
pub(crate) fn acknowledge(backend: Arc<dyn Backend>, id: CallId, cancel: CancellationToken) {
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = backend.mark_call_seen(id) => r,
        };
        if let Err(e) = result {
            tracing::warn!(call_id = %id, error = %e, "Failed to acknowledge call");
        }
    });
}
