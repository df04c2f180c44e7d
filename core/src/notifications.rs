//! Notification transport adapter
//!
//! Narrows raw pub/sub events into [`PushEvent`]s and fans them out to the
//! handlers registered per channel. The underlying transport channel is open
//! while at least one [`Subscription`] for it is alive.

use crate::error::{Error, Result};
use crate::models::{Call, ConversationId, Message, Role};
use crate::push::{PushTransport, RawEvent};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    User(u64),
    Admin(u64),
    Conversation(ConversationId),
}

impl ChannelKey {
    /// The per-identity channel call invitations are pushed to.
    pub fn identity(user_id: u64, role: Role) -> Self {
        match role {
            Role::User => ChannelKey::User(user_id),
            Role::Admin => ChannelKey::Admin(user_id),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::User(id) => write!(f, "user.{}", id),
            ChannelKey::Admin(id) => write!(f, "admin.{}", id),
            ChannelKey::Conversation(id) => write!(f, "conversation.{}", id),
        }
    }
}

/// Typed push event. Nothing downstream sees the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    MessageSent(Message),
    CallInitiated(Call),
    Other(String),
}

#[derive(Deserialize)]
struct MessagePayload {
    message: Message,
}

#[derive(Deserialize)]
struct CallPayload {
    #[serde(alias = "video_call", alias = "videoCall")]
    call: Call,
}

impl PushEvent {
    pub fn decode(event: &str, data: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match normalize_event_name(event).as_str() {
            "messagesent" => {
                PushEvent::MessageSent(serde_json::from_value::<MessagePayload>(data)?.message)
            }
            "callinitiated" | "incomingcall" => {
                PushEvent::CallInitiated(serde_json::from_value::<CallPayload>(data)?.call)
            }
            _ => PushEvent::Other(event.to_string()),
        })
    }
}

/// `App\Events\MessageSent`, `.MessageSent`, `message-sent` and `message.sent`
/// all name the same event.
fn normalize_event_name(event: &str) -> String {
    let short = event.rsplit('\\').next().unwrap_or(event);
    let short = short.strip_prefix('.').unwrap_or(short);
    short
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

type Callback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Named callbacks for one channel subscription.
#[derive(Default)]
pub struct EventHandlers {
    on_message_sent: Option<Callback<Message>>,
    on_call_initiated: Option<Callback<Call>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message_sent(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.on_message_sent = Some(Box::new(f));
        self
    }

    pub fn on_call_initiated(mut self, f: impl Fn(Call) + Send + Sync + 'static) -> Self {
        self.on_call_initiated = Some(Box::new(f));
        self
    }

    fn invoke(&self, event: &PushEvent) {
        match event {
            PushEvent::MessageSent(m) => {
                if let Some(ref f) = self.on_message_sent {
                    f(m.clone());
                }
            }
            PushEvent::CallInitiated(c) => {
                if let Some(ref f) = self.on_call_initiated {
                    f(c.clone());
                }
            }
            PushEvent::Other(_) => {}
        }
    }
}

struct Channel {
    handlers: Vec<(u64, Arc<EventHandlers>)>,
    /// Outcome of the transport subscribe, `None` while it is in flight.
    opened: watch::Receiver<Option<bool>>,
    /// Subscription that issued the transport subscribe.
    opener: u64,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, Channel>,
}

enum Join {
    Open(watch::Sender<Option<bool>>),
    Follow(watch::Receiver<Option<bool>>),
}

pub struct NotificationHub {
    transport: Arc<dyn PushTransport>,
    registry: Arc<Mutex<Registry>>,
}

impl NotificationHub {
    /// Spawns the dispatch task reading `events` until `cancel` fires.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        mut events: mpsc::UnboundedReceiver<RawEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));

        let dispatch_registry = registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = events.recv() => match raw {
                        Some(raw) => dispatch(&dispatch_registry, raw),
                        None => break,
                    },
                }
            }
            tracing::debug!("Notification dispatch stopped");
        });

        Self {
            transport,
            registry,
        }
    }

    /// Joins `key`. The first subscriber opens the transport channel; later
    /// ones wait for that outcome and fail with it.
    pub async fn subscribe(&self, key: ChannelKey, handlers: EventHandlers) -> Result<Subscription> {
        let channel = key.to_string();
        let (id, join) = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            let handlers = Arc::new(handlers);
            let join = match registry.channels.get_mut(&channel) {
                Some(entry) => {
                    entry.handlers.push((id, handlers));
                    Join::Follow(entry.opened.clone())
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    registry.channels.insert(
                        channel.clone(),
                        Channel {
                            handlers: vec![(id, handlers)],
                            opened: rx,
                            opener: id,
                        },
                    );
                    Join::Open(tx)
                }
            };
            (id, join)
        };

        let subscription = Subscription {
            channel: channel.clone(),
            id,
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            active: AtomicBool::new(true),
        };

        match join {
            Join::Open(opened) => {
                if let Err(e) = self.transport.subscribe(&channel).await {
                    self.abandon(&channel, id);
                    let _ = opened.send(Some(false));
                    subscription.release(false);
                    return Err(e);
                }
                let _ = opened.send(Some(true));
                tracing::debug!(channel = %channel, "Subscribed to push channel");
            }
            Join::Follow(mut opened) => {
                let ok = opened
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| *outcome == Some(true))
                    .unwrap_or(false);
                if !ok {
                    subscription.release(false);
                    return Err(Error::Push(format!("subscribing to {} failed", channel)));
                }
            }
        }

        Ok(subscription)
    }

    /// Drops a channel whose transport subscribe failed, waiting joiners included.
    fn abandon(&self, channel: &str, opener: u64) {
        let mut registry = self.registry.lock();
        if registry
            .channels
            .get(channel)
            .map_or(false, |c| c.opener == opener)
        {
            registry.channels.remove(channel);
        }
    }

    pub fn subscriber_count(&self, key: ChannelKey) -> usize {
        self.registry
            .lock()
            .channels
            .get(&key.to_string())
            .map_or(0, |c| c.handlers.len())
    }
}

fn dispatch(registry: &Mutex<Registry>, raw: RawEvent) {
    let handlers: Vec<Arc<EventHandlers>> = match registry.lock().channels.get(&raw.channel) {
        Some(entry) => entry.handlers.iter().map(|(_, h)| h.clone()).collect(),
        None => return,
    };

    let event = match PushEvent::decode(&raw.event, raw.data) {
        Ok(PushEvent::Other(name)) => {
            tracing::debug!(channel = %raw.channel, event = %name, "Ignoring push event");
            return;
        }
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(channel = %raw.channel, event = %raw.event, error = %e, "Malformed push payload");
            return;
        }
    };

    // Handlers run without the registry lock so they may (un)subscribe.
    for h in handlers {
        h.invoke(&event);
    }
}

/// Live registration on a channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    id: u64,
    registry: Arc<Mutex<Registry>>,
    transport: Arc<dyn PushTransport>,
    active: AtomicBool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Safe to call any number of times.
    pub fn unsubscribe(&self) {
        self.release(true);
    }

    fn release(&self, close_channel: bool) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let last = {
            let mut registry = self.registry.lock();
            match registry.channels.get_mut(&self.channel) {
                Some(entry) => {
                    entry.handlers.retain(|(id, _)| *id != self.id);
                    if entry.handlers.is_empty() {
                        registry.channels.remove(&self.channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last && close_channel {
            self.transport.unsubscribe(&self.channel);
            tracing::debug!(channel = %self.channel, "Unsubscribed from push channel");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_names_normalize() {
        for name in ["App\\Events\\MessageSent", ".MessageSent", "message-sent", "message.sent"] {
            assert_eq!(normalize_event_name(name), "messagesent", "{}", name);
        }
    }

    #[test]
    fn decodes_call_event() {
        let event = PushEvent::decode(
            ".CallInitiated",
            json!({ "call": {
                "id": 3, "room_id": "r", "initiator": { "id": 1, "name": "Ops" },
                "status": "initiated"
            }}),
        )
        .unwrap();

        match event {
            PushEvent::CallInitiated(call) => assert_eq!(call.room_id, "r"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_events_are_other() {
        let event = PushEvent::decode("UserTyping", json!({})).unwrap();
        assert_eq!(event, PushEvent::Other("UserTyping".into()));
    }

    #[test]
    fn channel_keys_render_as_laravel_names() {
        assert_eq!(ChannelKey::identity(5, Role::Admin).to_string(), "admin.5");
        assert_eq!(ChannelKey::Conversation(ConversationId(9)).to_string(), "conversation.9");
    }
}
