//! In-memory stand-ins for the backend, the push service and the audio device.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use clientdesk_core::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const CLIENT_ID: u64 = 7;
pub const ADMIN_ID: u64 = 1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn client_session() -> Session {
    Session::new(CLIENT_ID, Role::User, "client-token")
}

pub fn admin_session() -> Session {
    Session::new(ADMIN_ID, Role::Admin, "admin-token")
}

pub fn admin() -> Sender {
    Sender {
        id: ADMIN_ID,
        role: Role::Admin,
    }
}

pub fn client() -> Sender {
    Sender {
        id: CLIENT_ID,
        role: Role::User,
    }
}

pub fn ringing_call(id: u64) -> Call {
    Call {
        id: CallId(id),
        room_id: format!("room-{}", id),
        initiator: CallParty {
            id: ADMIN_ID,
            name: "Support".into(),
        },
        status: CallStatus::Initiated,
    }
}

pub fn server_message(id: u64, conversation: u64, sender: Sender, body: &str, minute: u32) -> Message {
    Message {
        id: MessageId::Server(id),
        conversation_id: Some(ConversationId(conversation)),
        sender,
        body: Some(body.to_string()),
        attachment: None,
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        is_read: false,
        is_pending: false,
    }
}

/// Lets spawned tasks run and moves the paused clock forward by a hair.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Confirm,
    ServerError,
    PhoneRequired,
}

pub struct FakeBackend {
    pub me: Sender,
    pub threads: Mutex<HashMap<ConversationId, Vec<Message>>>,
    pub incoming: Mutex<Vec<Call>>,
    pub unauthorized: AtomicBool,
    pub accept_refused: AtomicBool,
    pub send_outcome: Mutex<SendOutcome>,
    pub send_delay: Mutex<Duration>,
    pub fetch_delay: Mutex<Duration>,
    pub next_message_id: AtomicU64,
    pub created_conversation: ConversationId,
    pub polls: AtomicUsize,
    pub sent: Mutex<Vec<MessageDraft>>,
    pub seen_marks: Mutex<Vec<CallId>>,
    pub accepted: Mutex<Vec<CallId>>,
    pub rejected: Mutex<Vec<CallId>>,
    pub ended: Mutex<Vec<CallId>>,
}

impl FakeBackend {
    pub fn new(me: Sender) -> Arc<Self> {
        Arc::new(Self {
            me,
            threads: Mutex::new(HashMap::new()),
            incoming: Mutex::new(Vec::new()),
            unauthorized: AtomicBool::new(false),
            accept_refused: AtomicBool::new(false),
            send_outcome: Mutex::new(SendOutcome::Confirm),
            send_delay: Mutex::new(Duration::ZERO),
            fetch_delay: Mutex::new(Duration::ZERO),
            next_message_id: AtomicU64::new(42),
            created_conversation: ConversationId(9),
            polls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            seen_marks: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        })
    }

    pub fn seed(&self, conversation: u64, messages: Vec<Message>) {
        self.threads
            .lock()
            .insert(ConversationId(conversation), messages);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> Vec<CallId> {
        let mut ids = self.rejected.lock().clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<Message>> {
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Unauthorized);
        }
        Ok(self.threads.lock().get(&id).cloned().unwrap_or_default())
    }

    async fn send_message(&self, draft: &MessageDraft) -> Result<SentMessage> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().push(draft.clone());

        let outcome = *self.send_outcome.lock();
        match outcome {
            SendOutcome::ServerError => Err(Error::Status {
                status: 500,
                message: "Server Error".into(),
            }),
            SendOutcome::PhoneRequired => Err(Error::PhoneNumberRequired),
            SendOutcome::Confirm => {
                let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
                let conversation_id = draft.conversation_id.unwrap_or(self.created_conversation);
                let message = Message {
                    id: MessageId::Server(id),
                    conversation_id: Some(conversation_id),
                    sender: self.me,
                    body: draft.body.clone(),
                    attachment: draft.attachment.as_ref().map(|a| {
                        Attachment::new(
                            format!("https://files.test/{}", a.file_name),
                            Some(a.mime_type.clone()),
                        )
                    }),
                    created_at: Utc::now(),
                    is_read: false,
                    is_pending: false,
                };
                self.threads
                    .lock()
                    .entry(conversation_id)
                    .or_default()
                    .push(message.clone());

                let conversation = draft.conversation_id.is_none().then(|| Conversation {
                    id: conversation_id,
                    user_id: Some(self.me.id),
                    admin_id: None,
                    updated_at: None,
                });
                Ok(SentMessage {
                    message,
                    conversation,
                })
            }
        }
    }

    async fn update_message(&self, id: u64, body: &str) -> Result<Message> {
        let mut threads = self.threads.lock();
        let found = threads
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| m.id == MessageId::Server(id));
        match found {
            Some(message) => {
                message.body = Some(body.to_string());
                Ok(message.clone())
            }
            None => Err(Error::Status {
                status: 404,
                message: "Message not found".into(),
            }),
        }
    }

    async fn delete_message(&self, id: u64) -> Result<()> {
        for messages in self.threads.lock().values_mut() {
            messages.retain(|m| m.id != MessageId::Server(id));
        }
        Ok(())
    }

    async fn incoming_calls(&self) -> Result<Vec<Call>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Unauthorized);
        }
        Ok(self.incoming.lock().clone())
    }

    async fn mark_call_seen(&self, id: CallId) -> Result<()> {
        self.seen_marks.lock().push(id);
        Ok(())
    }

    async fn accept_call(&self, id: CallId) -> Result<()> {
        if self.accept_refused.load(Ordering::SeqCst) {
            return Err(Error::Status {
                status: 409,
                message: "Call is no longer available".into(),
            });
        }
        self.accepted.lock().push(id);
        Ok(())
    }

    async fn reject_call(&self, id: CallId) -> Result<()> {
        self.rejected.lock().push(id);
        Ok(())
    }

    async fn end_call(&self, id: CallId) -> Result<()> {
        self.ended.lock().push(id);
        Ok(())
    }
}

// ============================================================================
// Push
// ============================================================================

#[derive(Default)]
pub struct FakeTransport {
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub offline: AtomicBool,
    pub unauthorized: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(Error::Unauthorized);
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Push("not connected".into()));
        }
        self.subscribed.lock().push(channel.to_string());
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) {
        self.unsubscribed.lock().push(channel.to_string());
    }
}

/// Injects events as if the pub/sub service had delivered them.
#[derive(Clone)]
pub struct PushFeed {
    tx: mpsc::UnboundedSender<RawEvent>,
}

impl PushFeed {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RawEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn raw(&self, channel: &str, event: &str, data: Value) {
        let _ = self.tx.send(RawEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        });
    }

    pub fn message_sent(&self, channel: &str, message: &Message) {
        self.raw(channel, "App\\Events\\MessageSent", json!({ "message": message }));
    }

    pub fn call_initiated(&self, channel: &str, call: &Call) {
        self.raw(channel, ".CallInitiated", json!({ "call": call }));
    }
}

// ============================================================================
// Audio
// ============================================================================

#[derive(Default)]
pub struct CountingAudio {
    pub opened: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub tones: Arc<AtomicUsize>,
    pub broken: AtomicBool,
}

impl CountingAudio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn tones(&self) -> usize {
        self.tones.load(Ordering::SeqCst)
    }
}

impl AudioOutput for CountingAudio {
    fn open(&self) -> Result<Box<dyn ToneVoice>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Audio("no output device".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingVoice {
            live: self.live.clone(),
            tones: self.tones.clone(),
        }))
    }
}

struct CountingVoice {
    live: Arc<AtomicUsize>,
    tones: Arc<AtomicUsize>,
}

impl ToneVoice for CountingVoice {
    fn tone(&mut self, _frequency_hz: f32, _duration: Duration) {
        self.tones.fetch_add(1, Ordering::SeqCst);
    }

    fn silence(&mut self) {}
}

impl Drop for CountingVoice {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Client
// ============================================================================

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.timing.poll_interval_ms = 5_000;
    config.timing.ring_timeout_secs = 30;
    config.timing.ringtone_ceiling_secs = 30;
    config
}

pub struct Harness {
    pub client: Arc<RealtimeClient>,
    pub backend: Arc<FakeBackend>,
    pub transport: Arc<FakeTransport>,
    pub audio: Arc<CountingAudio>,
    pub push: PushFeed,
    pub guard: SessionGuard,
}

pub async fn try_start(
    session: Session,
    backend: Arc<FakeBackend>,
    transport: Arc<FakeTransport>,
) -> Result<Harness> {
    init_tracing();
    let audio = CountingAudio::new();
    let (push, events) = PushFeed::channel();
    let guard = SessionGuard::new();

    let parts = Parts {
        backend: backend.clone(),
        transport: transport.clone(),
        events,
        audio: audio.clone(),
    };
    let client = RealtimeClient::start(&test_config(), session, guard.clone(), parts).await?;

    Ok(Harness {
        client: Arc::new(client),
        backend,
        transport,
        audio,
        push,
        guard,
    })
}

pub async fn start(session: Session, backend: Arc<FakeBackend>) -> Harness {
    match try_start(session, backend, FakeTransport::new()).await {
        Ok(harness) => harness,
        Err(e) => panic!("client failed to start: {}", e),
    }
}
