//! Incoming-call presenter
//!
//! Holds at most one ringing call. States move `idle -> ringing ->
//! {accepted | rejected | expired} -> idle`; calls offered while another one
//! rings wait in a FIFO queue and ring next.

use crate::error::{Error, Result};
use crate::models::{Call, CallHandoff, CallId};
use crate::network::Backend;
use crate::ringtone::{Ringtone, RingtoneHandle};
use crate::seen::SeenCalls;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Ringing(Call),
    Accepted(CallHandoff),
    /// The backend refused the accept; the call stays dismissed.
    AcceptFailed(CallId),
    Rejected(CallId),
    Expired(CallId),
    /// A queued call waited longer than the ring timeout and never rang.
    Missed(CallId),
}

struct Ringing {
    call: Call,
    ringtone: RingtoneHandle,
    expiry: CancellationToken,
}

enum PresenterState {
    Idle,
    Ringing(Ringing),
}

struct Queued {
    call: Call,
    since: Instant,
}

struct Inner {
    state: PresenterState,
    queue: VecDeque<Queued>,
}

#[derive(Clone)]
pub struct CallPresenter {
    inner: Arc<Mutex<Inner>>,
    seen: SeenCalls,
    ringtone: Ringtone,
    backend: Arc<dyn Backend>,
    events: broadcast::Sender<CallEvent>,
    ring_timeout: Duration,
    cancel: CancellationToken,
}

impl CallPresenter {
    pub fn new(
        seen: SeenCalls,
        ringtone: Ringtone,
        backend: Arc<dyn Backend>,
        ring_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: PresenterState::Idle,
                queue: VecDeque::new(),
            })),
            seen,
            ringtone,
            backend,
            events,
            ring_timeout,
            cancel,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Option<Call> {
        match &self.inner.lock().state {
            PresenterState::Ringing(r) => Some(r.call.clone()),
            PresenterState::Idle => None,
        }
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self.inner.lock().state, PresenterState::Ringing(_))
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Admission gate shared by the push and poll paths.
    ///
    /// Returns `true` when the call was new and is now ringing or queued. The
    /// seen-store claim and the hand-over to the state machine happen without
    /// any suspension point in between.
    pub fn offer(&self, call: Call, source: CallSource) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !call.is_ringable() {
            tracing::debug!(call_id = %call.id, status = ?call.status, "Ignoring call that is no longer ringing");
            return false;
        }
        if !self.seen.claim(call.id) {
            tracing::debug!(call_id = %call.id, ?source, "Call already surfaced");
            return false;
        }

        tracing::info!(call_id = %call.id, from = %call.initiator.name, ?source, "Incoming call");
        self.present(call);
        true
    }

    fn present(&self, call: Call) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, PresenterState::Idle) {
            self.ring(&mut inner, call);
        } else if !inner.queue.iter().any(|q| q.call.id == call.id) {
            tracing::info!(call_id = %call.id, "Another call is ringing, queued");
            inner.queue.push_back(Queued {
                call,
                since: Instant::now(),
            });
        }
    }

    fn ring(&self, inner: &mut Inner, call: Call) {
        let ringtone = self.ringtone.play();
        let expiry = self.cancel.child_token();

        let presenter = self.clone();
        let token = expiry.clone();
        let call_id = call.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(presenter.ring_timeout) => presenter.expire(call_id).await,
            }
        });

        inner.state = PresenterState::Ringing(Ringing {
            call: call.clone(),
            ringtone,
            expiry,
        });
        let _ = self.events.send(CallEvent::Ringing(call));
    }

    /// Leaves `ringing`, releasing the ringtone and the expiry timer.
    fn finish(inner: &mut Inner) -> Option<Call> {
        match std::mem::replace(&mut inner.state, PresenterState::Idle) {
            PresenterState::Ringing(r) => {
                r.ringtone.stop();
                r.expiry.cancel();
                Some(r.call)
            }
            PresenterState::Idle => None,
        }
    }

    /// Rings the next queued call; stale ones are reported missed and returned.
    fn advance(&self, inner: &mut Inner) -> Vec<CallId> {
        let mut stale = Vec::new();
        if self.cancel.is_cancelled() {
            return stale;
        }

        while let Some(next) = inner.queue.pop_front() {
            if next.since.elapsed() >= self.ring_timeout {
                tracing::info!(call_id = %next.call.id, "Queued call went stale");
                let _ = self.events.send(CallEvent::Missed(next.call.id));
                stale.push(next.call.id);
                continue;
            }
            self.ring(inner, next.call);
            break;
        }
        stale
    }

    fn reject_in_background(&self, ids: Vec<CallId>) {
        for id in ids {
            let backend = self.backend.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = backend.reject_call(id) => r,
                };
                if let Err(e) = result {
                    tracing::warn!(call_id = %id, error = %e, "Failed to reject call");
                }
            });
        }
    }

    /// User accepted the ringing call. Ringing stops at once and does not
    /// resume; the hand-off is published only once the backend confirms.
    pub async fn accept(&self) -> Result<CallHandoff> {
        let (handoff, stale) = {
            let mut inner = self.inner.lock();
            let call = Self::finish(&mut inner).ok_or(Error::NoRingingCall)?;
            let handoff = CallHandoff {
                call_id: call.id,
                room_id: call.room_id,
            };
            (handoff, self.advance(&mut inner))
        };
        self.reject_in_background(stale);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.backend.accept_call(handoff.call_id) => r,
        };
        match result {
            Ok(()) => {
                tracing::info!(call_id = %handoff.call_id, "Call accepted");
                let _ = self.events.send(CallEvent::Accepted(handoff.clone()));
                Ok(handoff)
            }
            Err(e) => {
                tracing::warn!(call_id = %handoff.call_id, error = %e, "Accepting call failed");
                let _ = self.events.send(CallEvent::AcceptFailed(handoff.call_id));
                Err(e)
            }
        }
    }

    pub async fn reject(&self) -> Result<CallId> {
        let (id, stale) = {
            let mut inner = self.inner.lock();
            let call = Self::finish(&mut inner).ok_or(Error::NoRingingCall)?;
            let _ = self.events.send(CallEvent::Rejected(call.id));
            (call.id, self.advance(&mut inner))
        };
        self.reject_in_background(stale);

        tracing::info!(call_id = %id, "Call rejected");
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.backend.reject_call(id) => r?,
        }
        Ok(id)
    }

    /// Timer path: behaves like a reject, but failures are only logged.
    async fn expire(&self, id: CallId) {
        let stale = {
            let mut inner = self.inner.lock();
            let still_ringing =
                matches!(&inner.state, PresenterState::Ringing(r) if r.call.id == id);
            if !still_ringing {
                return;
            }
            Self::finish(&mut inner);
            let _ = self.events.send(CallEvent::Expired(id));
            self.advance(&mut inner)
        };
        self.reject_in_background(stale);

        tracing::info!(call_id = %id, "Call expired without an answer");
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.backend.reject_call(id) => r,
        };
        if let Err(e) = result {
            tracing::warn!(call_id = %id, error = %e, "Failed to report expired call");
        }
    }

    /// Stops ringing, cancels timers and drops the queue.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock();
        Self::finish(&mut inner);
        inner.queue.clear();
        self.ringtone.stop();
    }
}
