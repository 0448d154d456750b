use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author: Role,
    pub text: Option<String>,
    pub attachment_id: Option<String>,
    pub model: Option<String>,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields of a message that is about to be appended.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub text: Option<String>,
    pub attachment_id: Option<String>,
    pub model: Option<String>,
    pub is_error: bool,
}

impl NewMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attachment(mut self, attachment_id: impl Into<String>) -> Self {
        self.attachment_id = Some(attachment_id.into());
        self
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            is_error: true,
            ..Default::default()
        }
    }

    /// A message needs visible text or an attachment.
    pub fn has_body(&self) -> bool {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        has_text || self.attachment_id.is_some()
    }
}
