//! Network layer - REST backend seam and its reqwest implementation

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::models::*;
use crate::session::{Session, SessionGuard};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Everything the core asks of the backend.
///
/// Implementations must map a 401 to [`Error::Unauthorized`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<Message>>;

    async fn send_message(&self, draft: &MessageDraft) -> Result<SentMessage>;

    async fn update_message(&self, id: u64, body: &str) -> Result<Message>;

    async fn delete_message(&self, id: u64) -> Result<()>;

    async fn incoming_calls(&self) -> Result<Vec<Call>>;

    async fn mark_call_seen(&self, id: CallId) -> Result<()>;

    async fn accept_call(&self, id: CallId) -> Result<()>;

    async fn reject_call(&self, id: CallId) -> Result<()>;

    async fn end_call(&self, id: CallId) -> Result<()>;
}

// ============================================================================
// Wire payloads
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum MessagesPayload {
    List(Vec<Message>),
    Wrapped { messages: Vec<Message> },
    Data { data: Vec<Message> },
}

impl MessagesPayload {
    fn into_messages(self) -> Vec<Message> {
        match self {
            MessagesPayload::List(m) => m,
            MessagesPayload::Wrapped { messages } => messages,
            MessagesPayload::Data { data } => data,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SentPayload {
    Wrapped {
        message: Message,
        #[serde(default)]
        conversation: Option<Conversation>,
    },
    Bare(Message),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CallsPayload {
    List(Vec<Call>),
    Wrapped { calls: Vec<Call> },
    Data { data: Vec<Call> },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UpdatedPayload {
    Wrapped { message: Message },
    Bare(Message),
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: LoginUser,
}

#[derive(Debug, Deserialize)]
pub struct LoginUser {
    pub id: u64,
    #[serde(alias = "type", default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_role() -> Role {
    Role::User
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    config: ClientConfig,
    session: Session,
    guard: SessionGuard,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, session: Session, guard: SessionGuard) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            session,
            guard,
        })
    }

    /// Exchanges credentials for a bearer token. Used before a [`Session`] exists.
    pub async fn login(config: &ClientConfig, email: &str, password: &str) -> Result<Session> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let resp = client
            .post(config.api_url("login")?)
            .header("Accept", "application/json")
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let data: LoginResponse = resp.json().await?;

        Ok(Session::new(data.user.id, data.user.role, data.token))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.config.api_url(path)?)
            .header("Authorization", self.session.bearer())
            .header("Accept", "application/json"))
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req.send().await?;
        match check_status(resp).await {
            Err(Error::Unauthorized) => {
                self.guard.invalidate();
                Err(Error::Unauthorized)
            }
            other => other,
        }
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let req = self.request(reqwest::Method::POST, path)?;
        self.execute(req).await?;
        Ok(())
    }
}

/// Maps non-success statuses into the error taxonomy.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }

    let text = resp.text().await.unwrap_or_default();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();

    if requires_phone(status, &body) {
        return Err(Error::PhoneNumberRequired);
    }

    let message = body["message"]
        .as_str()
        .or_else(|| body["error"].as_str())
        .map(str::to_string)
        .unwrap_or(text);

    Err(Error::Status {
        status: status.as_u16(),
        message,
    })
}

/// The portal refuses to send messages for accounts without a verified phone number.
fn requires_phone(status: StatusCode, body: &serde_json::Value) -> bool {
    if status != StatusCode::UNPROCESSABLE_ENTITY && status != StatusCode::FORBIDDEN {
        return false;
    }
    body["requires_phone"].as_bool() == Some(true)
        || body["error_code"].as_str() == Some("PHONE_REQUIRED")
        || body["errors"].get("phone").is_some()
        || body["errors"].get("phone_number").is_some()
}

#[async_trait]
impl Backend for ApiClient {
    async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<Message>> {
        let req = self.request(reqwest::Method::GET, &format!("conversations/{}", id))?;
        let resp = self.execute(req).await?;
        let payload: MessagesPayload = resp.json().await?;
        Ok(payload.into_messages())
    }

    async fn send_message(&self, draft: &MessageDraft) -> Result<SentMessage> {
        let mut form = reqwest::multipart::Form::new()
            .text("message", draft.body.clone().unwrap_or_default());

        if let Some(id) = draft.conversation_id {
            form = form.text("conversation_id", id.to_string());
        }
        if let Some(receiver) = draft.receiver_id {
            form = form.text("receiver_id", receiver.to_string());
        }
        if let Some(ref attachment) = draft.attachment {
            let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| Error::Http(e.to_string()))?;
            form = form.part("file", part);
        }

        let req = self.request(reqwest::Method::POST, "messages/send")?.multipart(form);
        let resp = self.execute(req).await?;

        let payload: SentPayload = resp.json().await?;
        Ok(match payload {
            SentPayload::Wrapped {
                message,
                conversation,
            } => SentMessage {
                message,
                conversation,
            },
            SentPayload::Bare(message) => SentMessage {
                message,
                conversation: None,
            },
        })
    }

    async fn update_message(&self, id: u64, body: &str) -> Result<Message> {
        let req = self
            .request(reqwest::Method::PUT, &format!("messages/{}", id))?
            .json(&json!({ "message": body }));
        let resp = self.execute(req).await?;
        let payload: UpdatedPayload = resp.json().await?;
        Ok(match payload {
            UpdatedPayload::Wrapped { message } | UpdatedPayload::Bare(message) => message,
        })
    }

    async fn delete_message(&self, id: u64) -> Result<()> {
        let req = self.request(reqwest::Method::DELETE, &format!("messages/{}", id))?;
        self.execute(req).await?;
        Ok(())
    }

    async fn incoming_calls(&self) -> Result<Vec<Call>> {
        let req = self.request(reqwest::Method::GET, "incoming-calls")?;
        let resp = self.execute(req).await?;
        let payload: CallsPayload = resp.json().await?;
        Ok(match payload {
            CallsPayload::List(calls) => calls,
            CallsPayload::Wrapped { calls } => calls,
            CallsPayload::Data { data } => data,
        })
    }

    async fn mark_call_seen(&self, id: CallId) -> Result<()> {
        self.post_empty(&format!("incoming-calls/{}/seen", id)).await
    }

    async fn accept_call(&self, id: CallId) -> Result<()> {
        self.post_empty(&format!("incoming-calls/{}/accept", id)).await
    }

    async fn reject_call(&self, id: CallId) -> Result<()> {
        self.post_empty(&format!("incoming-calls/{}/reject", id)).await
    }

    async fn end_call(&self, id: CallId) -> Result<()> {
        self.post_empty(&format!("video-calls/{}/end", id)).await
    }
}
