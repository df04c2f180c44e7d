//! Error types for the clientdesk core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server rejected request ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Session is no longer authorized")]
    Unauthorized,

    #[error("A verified phone number is required before sending messages")]
    PhoneNumberRequired,

    #[error("Message has neither text nor attachment")]
    EmptyMessage,

    #[error("No incoming call is ringing")]
    NoRingingCall,

    #[error("No conversation is open")]
    NoConversation,

    #[error("Response arrived after the conversation changed")]
    Stale,

    #[error("Push transport error: {0}")]
    Push(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 401 from the backend or the broadcast auth endpoint.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized)
    }

    /// Failures that a background path may log and retry on its next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Http(_) | Error::WebSocket(_) | Error::Push(_) => true,
            Error::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// Failures that need the user to supply something before retrying.
    pub fn requires_user_input(&self) -> bool {
        matches!(self, Error::PhoneNumberRequired | Error::EmptyMessage)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::Network(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(e.to_string())
    }
}
