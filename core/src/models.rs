//! Data models for the clientdesk core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identity
// ============================================================================

/// Which side of the portal an account (or a message sender) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Laravel may send either the short name or the morph class ("App\\Models\\Admin").
impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let short = raw.rsplit('\\').next().unwrap_or(&raw).to_ascii_lowercase();
        match short.as_str() {
            "user" | "client" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(serde::de::Error::custom(format!("unknown role: {}", raw))),
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Initiated,
    Ongoing,
    Ended,
    Missed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParty {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// One video-call invitation. Status is owned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub room_id: String,
    #[serde(alias = "caller")]
    pub initiator: CallParty,
    pub status: CallStatus,
}

impl Call {
    /// Only calls still waiting for an answer may ring.
    pub fn is_ringable(&self) -> bool {
        self.status == CallStatus::Initiated
    }
}

/// What the call-joining flow needs once a call is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandoff {
    pub call_id: CallId,
    pub room_id: String,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server ids are numeric; optimistic placeholders carry a local uuid until confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Server(u64),
    Local(Uuid),
}

impl MessageId {
    pub fn placeholder() -> Self {
        MessageId::Local(Uuid::new_v4())
    }

    pub fn server_id(&self) -> Option<u64> {
        match self {
            MessageId::Server(id) => Some(*id),
            MessageId::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Server(id) => write!(f, "{}", id),
            MessageId::Local(uuid) => write!(f, "local-{}", uuid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
}

impl AttachmentKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or_default() {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            "audio" => AttachmentKind::Audio,
            _ => AttachmentKind::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub mime_type: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    /// Falls back to guessing the mime type from the url when the backend omits it.
    pub fn new(url: String, mime_type: Option<String>) -> Self {
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                let path = url.split(['?', '#']).next().unwrap_or(&url);
                mime_guess::from_path(path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        let kind = AttachmentKind::from_mime(&mime_type);
        Self { url, mime_type, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    pub id: u64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: Option<ConversationId>,
    pub sender: Sender,
    pub body: Option<String>,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_pending: bool,
}

impl Message {
    pub fn is_from(&self, user_id: u64, role: Role) -> bool {
        self.sender.id == user_id && self.sender.role == role
    }
}

/// Flat record shape used by the backend and the push service.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    id: MessageId,
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    sender_id: u64,
    sender_type: Role,
    #[serde(default, alias = "message")]
    body: Option<String>,
    #[serde(default, alias = "file_url", alias = "file_path")]
    attachment_url: Option<String>,
    #[serde(default, alias = "file_type", alias = "mime_type")]
    attachment_mime: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "flexible_bool")]
    is_read: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_pending: bool,
}

impl From<MessageRecord> for Message {
    fn from(r: MessageRecord) -> Self {
        Self {
            id: r.id,
            conversation_id: r.conversation_id,
            sender: Sender {
                id: r.sender_id,
                role: r.sender_type,
            },
            body: r.body,
            attachment: r
                .attachment_url
                .filter(|u| !u.is_empty())
                .map(|url| Attachment::new(url, r.attachment_mime)),
            created_at: r.created_at,
            is_read: r.is_read,
            is_pending: r.is_pending,
        }
    }
}

impl From<Message> for MessageRecord {
    fn from(m: Message) -> Self {
        let (attachment_url, attachment_mime) = match m.attachment {
            Some(a) => (Some(a.url), Some(a.mime_type)),
            None => (None, None),
        };
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_id: m.sender.id,
            sender_type: m.sender.role,
            body: m.body,
            attachment_url,
            attachment_mime,
            created_at: m.created_at,
            is_read: m.is_read,
            is_pending: m.is_pending,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MessageRecord::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        MessageRecord::deserialize(deserializer).map(Message::from)
    }
}

// MySQL booleans arrive as 0/1.
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

// ============================================================================
// Outgoing drafts
// ============================================================================

#[derive(Debug, Clone)]
pub struct DraftAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl DraftAttachment {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }
}

/// A message the user intends to send. `conversation_id` is empty for the first
/// message of a brand new conversation.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub conversation_id: Option<ConversationId>,
    pub receiver_id: Option<u64>,
    pub body: Option<String>,
    pub attachment: Option<DraftAttachment>,
}

impl MessageDraft {
    pub fn text(conversation_id: Option<ConversationId>, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: DraftAttachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn is_empty(&self) -> bool {
        let no_text = self.body.as_deref().map_or(true, |b| b.trim().is_empty());
        no_text && self.attachment.is_none()
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub admin_id: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Server confirmation of a send, with the conversation when the send created one.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message: Message,
    pub conversation: Option<Conversation>,
}
