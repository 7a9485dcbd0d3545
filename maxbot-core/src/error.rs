use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaxbotError {
    #[error("Bot error: {0}")]
    Bot(String),

    #[error("API error: status={status} message={message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("dispatch timed out after {timeout_ms}ms")]
    DispatchTimeout { timeout_ms: u64 },

    #[error("long polling is already running")]
    AlreadyRunning,

    #[error("scene not found: {0}")]
    SceneNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MaxbotError {
    /// True for transport failures worth retrying: 408, 429, 5xx and connect/timeout errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            MaxbotError::Api { status, .. } => is_retryable_status(*status),
            MaxbotError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Server-provided delay hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MaxbotError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MaxbotError::DispatchTimeout { .. })
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Handler failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, MaxbotError>;
