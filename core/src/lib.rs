//! Clientdesk Core Library
//!
//! Real-time layer of the client portal: conversation sync with optimistic
//! sends, and incoming-call detection over push and polling with a single ring.

pub mod config;
pub mod error;
pub mod models;
pub mod network;
pub mod notifications;
pub mod poller;
pub mod presenter;
pub mod push;
pub mod reconciler;
pub mod ringtone;
pub mod seen;
pub mod session;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use config::*;
pub use error::*;
pub use models::*;
pub use network::*;
pub use notifications::*;
pub use poller::*;
pub use presenter::*;
pub use push::*;
pub use reconciler::*;
pub use ringtone::*;
pub use seen::*;
pub use session::*;

/// Pluggable edges of the client.
pub struct Parts {
    pub backend: Arc<dyn Backend>,
    pub transport: Arc<dyn PushTransport>,
    pub events: mpsc::UnboundedReceiver<RawEvent>,
    pub audio: Arc<dyn AudioOutput>,
}

/// Main client instance
///
/// Owns every timer and background task of the core under one cancellation
/// token; [`RealtimeClient::shutdown`] (or dropping the client) tears them all down.
pub struct RealtimeClient {
    session: Session,
    guard: SessionGuard,
    backend: Arc<dyn Backend>,
    hub: NotificationHub,
    presenter: CallPresenter,
    reconciler: ConversationReconciler,
    poller: PollerHandle,
    identity: Mutex<Option<Subscription>>,
    conversation: Mutex<Option<Subscription>>,
    cancel: CancellationToken,
}

impl RealtimeClient {
    /// Connects to the real backend and push service.
    pub async fn connect(
        config: &ClientConfig,
        session: Session,
        guard: SessionGuard,
        audio: Arc<dyn AudioOutput>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let backend = Arc::new(ApiClient::new(config, session.clone(), guard.clone())?);
        let (socket, events) =
            PusherSocket::start(config, session.clone(), guard.clone(), cancel.child_token())?;

        let parts = Parts {
            backend,
            transport: Arc::new(socket),
            events,
            audio,
        };
        Self::start_with(config, session, guard, parts, cancel).await
    }

    pub async fn start(
        config: &ClientConfig,
        session: Session,
        guard: SessionGuard,
        parts: Parts,
    ) -> Result<Self> {
        Self::start_with(config, session, guard, parts, CancellationToken::new()).await
    }

    async fn start_with(
        config: &ClientConfig,
        session: Session,
        guard: SessionGuard,
        parts: Parts,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let Parts {
            backend,
            transport,
            events,
            audio,
        } = parts;

        let seen = SeenCalls::new();
        let ringtone = Ringtone::new(
            audio,
            TonePattern::default(),
            config.timing.ringtone_ceiling(),
        );
        let presenter = CallPresenter::new(
            seen,
            ringtone,
            backend.clone(),
            config.timing.ring_timeout(),
            cancel.child_token(),
        );
        let me = Sender {
            id: session.user_id,
            role: session.role,
        };
        let reconciler = ConversationReconciler::new(backend.clone(), me, cancel.child_token());
        let hub = NotificationHub::new(transport, events, cancel.child_token());

        let poller = IncomingCallPoller::new(
            backend.clone(),
            presenter.clone(),
            guard.clone(),
            config.timing.poll_interval(),
        )
        .spawn(cancel.child_token());

        let client = Self {
            session,
            guard,
            backend,
            hub,
            presenter,
            reconciler,
            poller,
            identity: Mutex::new(None),
            conversation: Mutex::new(None),
            cancel,
        };

        // Push is best effort: polling still surfaces calls if this fails.
        match client.watch_identity().await {
            Ok(()) => {}
            Err(Error::Unauthorized) => return Err(Error::Unauthorized),
            Err(e) => tracing::warn!(error = %e, "Push subscription failed, relying on polling"),
        }

        tracing::info!(user_id = client.session.user_id, role = %client.session.role, "Realtime client started");
        Ok(client)
    }

    async fn watch_identity(&self) -> Result<()> {
        let presenter = self.presenter.clone();
        let backend = self.backend.clone();
        let ack_cancel = self.cancel.child_token();
        let reconciler = self.reconciler.clone();

        let handlers = EventHandlers::new()
            .on_call_initiated(move |call| {
                let id = call.id;
                if presenter.offer(call, CallSource::Push) {
                    poller::acknowledge(backend.clone(), id, ack_cancel.clone());
                }
            })
            .on_message_sent(move |message| {
                reconciler.on_push_message(message);
            });

        let key = ChannelKey::identity(self.session.user_id, self.session.role);
        let subscription = self.hub.subscribe(key, handlers).await?;
        *self.identity.lock() = Some(subscription);
        Ok(())
    }

    async fn watch_conversation(&self, id: ConversationId) {
        let key = ChannelKey::Conversation(id);
        let channel = key.to_string();
        let already_watching = self
            .conversation
            .lock()
            .as_ref()
            .map_or(false, |s| s.channel() == channel && s.is_active());
        if already_watching {
            return;
        }

        let reconciler = self.reconciler.clone();
        let handlers = EventHandlers::new().on_message_sent(move |mut message| {
            message.conversation_id.get_or_insert(id);
            reconciler.on_push_message(message);
        });

        match self.hub.subscribe(key, handlers).await {
            Ok(subscription) => {
                let previous = self.conversation.lock().replace(subscription);
                drop(previous);
            }
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "Conversation push unavailable")
            }
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Flips to `true` on the first 401 seen anywhere in the core.
    pub fn session_invalidated(&self) -> watch::Receiver<bool> {
        self.guard.subscribe()
    }

    pub fn calls(&self) -> &CallPresenter {
        &self.presenter
    }

    pub fn conversation(&self) -> &ConversationReconciler {
        &self.reconciler
    }

    pub fn notifications(&self) -> &NotificationHub {
        &self.hub
    }

    /// Switches to `id`: subscribes to its channel and replaces the cached list.
    pub async fn open_conversation(&self, id: ConversationId) -> Result<Vec<Message>> {
        self.watch_conversation(id).await;
        self.reconciler.load(id).await
    }

    pub async fn send_message(&self, draft: MessageDraft) -> Result<SentMessage> {
        let open = self.reconciler.conversation_id();
        if open.is_none()
            && draft.conversation_id.is_none()
            && draft.receiver_id.is_none()
            && self.session.role == Role::Admin
        {
            return Err(Error::NoConversation);
        }

        let sent = self.reconciler.send(draft).await?;

        if open.is_none() {
            if let Some(id) = self.reconciler.conversation_id() {
                self.watch_conversation(id).await;
            }
        }
        Ok(sent)
    }

    /// Re-fetch after the UI regains visibility.
    pub async fn refresh(&self) {
        self.reconciler.refresh().await;
    }

    pub async fn end_call(&self, id: CallId) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = self.backend.end_call(id) => r,
        }
    }

    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.poller.stop();
        self.presenter.dispose();
        self.conversation.lock().take();
        self.identity.lock().take();
        tracing::info!("Realtime client stopped");
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
