use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::AuthError(_))
    }

    /// Map a non-success upstream status to an error. `message` is only used
    /// when the status is neither an auth failure nor a rate limit.
    pub fn from_status(
        status: reqwest::StatusCode,
        retry_after: Option<&reqwest::header::HeaderValue>,
        message: String,
    ) -> Self {
        match status {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                ProviderError::AuthError("Invalid API key".to_string())
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
                retry_after_secs: retry_after
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok()),
            },
            _ => ProviderError::RequestFailed(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    pub fn to_data_uri(&self) -> String {
        use base64::Engine;
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip)]
    pub images: Vec<ImageAttachment>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ChatRequest {
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("messages", &self.messages)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("system_prompt", &self.system_prompt)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token(String),
    Done {
        tokens_in: Option<i64>,
        tokens_out: Option<i64>,
    },
    Error(ProviderError),
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
}
