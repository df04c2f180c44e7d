//! Conversation message reconciler
//!
//! Keeps the cached message list of the open conversation consistent across
//! three writers: full fetches, push deliveries and optimistic sends.

use crate::error::{Error, Result};
use crate::models::*;
use crate::network::Backend;
use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Thread {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    generation: u64,
}

impl Thread {
    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.id == *id)
    }
}

#[derive(Clone)]
pub struct ConversationReconciler {
    backend: Arc<dyn Backend>,
    me: Sender,
    thread: Arc<Mutex<Thread>>,
    cancel: CancellationToken,
}

impl ConversationReconciler {
    pub fn new(backend: Arc<dyn Backend>, me: Sender, cancel: CancellationToken) -> Self {
        Self {
            backend,
            me,
            thread: Arc::new(Mutex::new(Thread::default())),
            cancel,
        }
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.thread.lock().conversation_id
    }

    /// Messages in display order (by `created_at`, ties keep arrival order).
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = self.thread.lock().messages.clone();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            r = fut => r,
        }
    }

    /// Authoritative fetch. Replaces the cached list; unconfirmed sends of the
    /// same conversation are kept since the server does not know them yet.
    pub async fn load(&self, id: ConversationId) -> Result<Vec<Message>> {
        let generation = {
            let mut thread = self.thread.lock();
            thread.generation += 1;
            if thread.conversation_id != Some(id) {
                thread.conversation_id = Some(id);
                thread.messages.clear();
            }
            thread.generation
        };

        let fetched = self.guarded(self.backend.conversation_messages(id)).await?;

        let mut thread = self.thread.lock();
        if thread.generation != generation || thread.conversation_id != Some(id) {
            return Err(Error::Stale);
        }

        let pending: Vec<Message> = thread
            .messages
            .drain(..)
            .filter(|m| m.is_pending)
            .collect();

        let mut messages: Vec<Message> = Vec::with_capacity(fetched.len() + pending.len());
        for mut m in fetched {
            if messages.iter().any(|existing| existing.id == m.id) {
                continue;
            }
            m.is_pending = false;
            messages.push(m);
        }
        messages.extend(pending);
        thread.messages = messages;

        tracing::debug!(conversation_id = %id, count = thread.messages.len(), "Conversation loaded");

        let mut sorted = thread.messages.clone();
        sorted.sort_by_key(|m| m.created_at);
        Ok(sorted)
    }

    /// Background re-fetch (e.g. the window became visible again). Never fails.
    pub async fn refresh(&self) {
        let Some(id) = self.conversation_id() else {
            return;
        };
        match self.load(id).await {
            Ok(_) | Err(Error::Stale) | Err(Error::Cancelled) => {}
            Err(e) => tracing::warn!(conversation_id = %id, error = %e, "Conversation refresh failed"),
        }
    }

    /// Push delivery. Returns `true` if the message was new to the open conversation.
    ///
    /// Messages must name their conversation; callers on a conversation
    /// channel fill it in from the channel.
    pub fn on_push_message(&self, mut message: Message) -> bool {
        let mut thread = self.thread.lock();

        let Some(open) = thread.conversation_id else {
            return false;
        };
        if message.conversation_id != Some(open) {
            return false;
        }
        if thread.contains(&message.id) {
            tracing::debug!(message_id = %message.id, "Duplicate push delivery ignored");
            return false;
        }

        message.is_pending = false;
        thread.messages.push(message);
        true
    }

    /// Optimistic send. The placeholder is visible until the backend answers;
    /// on failure it is removed and nothing else changes. A draft addressed to
    /// another conversation than the open one is sent without a placeholder.
    pub async fn send(&self, mut draft: MessageDraft) -> Result<SentMessage> {
        if draft.is_empty() {
            return Err(Error::EmptyMessage);
        }

        let placeholder_id = MessageId::placeholder();
        {
            let mut thread = self.thread.lock();
            if draft.conversation_id.is_none() {
                draft.conversation_id = thread.conversation_id;
            }
            let elsewhere =
                thread.conversation_id.is_some() && draft.conversation_id != thread.conversation_id;
            if !elsewhere {
                thread.messages.push(Message {
                    id: placeholder_id,
                    conversation_id: draft.conversation_id,
                    sender: self.me,
                    body: draft.body.clone(),
                    attachment: draft.attachment.as_ref().map(|a| Attachment {
                        url: format!("local://{}", a.file_name),
                        mime_type: a.mime_type.clone(),
                        kind: AttachmentKind::from_mime(&a.mime_type),
                    }),
                    created_at: Utc::now(),
                    is_read: true,
                    is_pending: true,
                });
            }
        }

        let result = self.guarded(self.backend.send_message(&draft)).await;

        let mut thread = self.thread.lock();
        let slot = thread.messages.iter().position(|m| m.id == placeholder_id);

        match result {
            Ok(sent) => {
                let mut confirmed = sent.message;
                confirmed.is_pending = false;

                if let Some(pos) = slot {
                    // The push echo may have beaten the HTTP response.
                    if thread.contains(&confirmed.id) {
                        thread.messages.remove(pos);
                    } else {
                        thread.messages[pos] = confirmed.clone();
                    }
                    if thread.conversation_id.is_none() {
                        thread.conversation_id = sent
                            .conversation
                            .as_ref()
                            .map(|c| c.id)
                            .or(confirmed.conversation_id);
                    }
                }

                Ok(SentMessage {
                    message: confirmed,
                    conversation: sent.conversation,
                })
            }
            Err(e) => {
                if let Some(pos) = slot {
                    thread.messages.remove(pos);
                }
                if e.requires_user_input() {
                    tracing::info!(error = %e, "Send needs user input");
                } else {
                    tracing::warn!(error = %e, "Send failed, optimistic message rolled back");
                }
                Err(e)
            }
        }
    }

    pub async fn edit(&self, id: u64, body: &str) -> Result<Message> {
        let mut updated = self.guarded(self.backend.update_message(id, body)).await?;
        updated.is_pending = false;

        let mut thread = self.thread.lock();
        if let Some(slot) = thread
            .messages
            .iter_mut()
            .find(|m| m.id == MessageId::Server(id))
        {
            *slot = updated.clone();
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        self.guarded(self.backend.delete_message(id)).await?;
        self.thread
            .lock()
            .messages
            .retain(|m| m.id != MessageId::Server(id));
        Ok(())
    }

    /// Forgets the open conversation.
    pub fn close(&self) {
        let mut thread = self.thread.lock();
        thread.generation += 1;
        thread.conversation_id = None;
        thread.messages.clear();
    }
}
