use anyhow::Result;
use chrono::Utc;
use thiserror::Error;

use crate::models::{Conversation, Message, NewMessage, Role, DEFAULT_CONVERSATION_NAME};
use crate::services::database::Database;

pub const MAX_NAME_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found")]
    NotFound,

    #[error("Not authorized to access this conversation")]
    Forbidden,

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Conversation and message access with per-owner checks. Everything that
/// writes conversation or message rows goes through here.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    db: Database,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_conversation(
        &self,
        owner_id: &str,
        name: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let name = name
            .map(normalize_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_NAME.to_string());
        let now = Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name,
            pinned: false,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_conversation(&conversation).await?;
        tracing::debug!(conversation_id = %conversation.id, "created conversation");
        Ok(conversation)
    }

    pub async fn list_conversations(&self, owner_id: &str) -> Result<Vec<Conversation>> {
        self.db.list_conversations(owner_id).await
    }

    /// `None` when the conversation is missing or belongs to someone else.
    pub async fn get_conversation(&self, owner_id: &str, id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .db
            .get_conversation(id)
            .await?
            .filter(|c| c.owner_id == owner_id))
    }

    /// The conversation, provided `owner_id` owns it.
    pub async fn owned(&self, owner_id: &str, id: &str) -> Result<Conversation, StoreError> {
        let conversation = self.db.get_conversation(id).await?.ok_or(StoreError::NotFound)?;
        if conversation.owner_id != owner_id {
            return Err(StoreError::Forbidden);
        }
        Ok(conversation)
    }

    pub async fn delete_conversation(&self, owner_id: &str, id: &str) -> Result<(), StoreError> {
        self.owned(owner_id, id).await?;
        let removed = self.db.delete_conversation(id).await?;
        tracing::info!(conversation_id = id, messages = removed, "deleted conversation");
        Ok(())
    }

    /// Internal rename used by title generation. No ownership check.
    pub async fn rename_conversation(&self, id: &str, name: &str) -> Result<bool, StoreError> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("Name must not be empty".to_string()));
        }
        Ok(self.db.rename_conversation(id, &name).await?)
    }

    pub async fn rename_conversation_for(
        &self,
        owner_id: &str,
        id: &str,
        name: &str,
    ) -> Result<Conversation, StoreError> {
        let mut conversation = self.owned(owner_id, id).await?;
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("Name must not be empty".to_string()));
        }
        self.db.rename_conversation(id, &name).await?;
        conversation.name = name;
        Ok(conversation)
    }

    /// Flip the pinned flag and return the new value.
    pub async fn toggle_pin(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let conversation = self.owned(owner_id, id).await?;
        let pinned = !conversation.pinned;
        self.db.set_conversation_pinned(id, pinned).await?;
        Ok(pinned)
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        author: Role,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        if !message.has_body() {
            return Err(StoreError::InvalidArgument(
                "Message must have either text or an image.".to_string(),
            ));
        }
        Ok(self.db.insert_message(conversation_id, author, message).await?)
    }

    /// Messages in insertion order. Empty, not an error, when the caller
    /// does not own the conversation or it does not exist.
    pub async fn list_messages(&self, owner_id: &str, id: &str) -> Result<Vec<Message>> {
        match self.get_conversation(owner_id, id).await? {
            Some(_) => self.db.list_messages(id).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        self.db.recent_messages(conversation_id, limit).await
    }
}

/// First line, surrounding quotes stripped, capped at `MAX_NAME_CHARS`.
pub fn normalize_name(raw: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or("");
    let trimmed = first_line
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if trimmed.chars().count() > MAX_NAME_CHARS {
        trimmed.chars().take(MAX_NAME_CHARS).collect::<String>().trim_end().to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ConversationStore {
        let db = Database::new_in_memory().unwrap();
        db.upsert_user("alice", None, None).await.unwrap();
        db.upsert_user("bob", None, None).await.unwrap();
        ConversationStore::new(db)
    }

    #[tokio::test]
    async fn test_default_name() {
        let store = store().await;
        let conv = store.create_conversation("alice", None).await.unwrap();
        assert_eq!(conv.name, "New Chat");
        let conv = store.create_conversation("alice", Some("  ")).await.unwrap();
        assert_eq!(conv.name, "New Chat");
        let conv = store.create_conversation("alice", Some("Trip plans")).await.unwrap();
        assert_eq!(conv.name, "Trip plans");
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_per_owner() {
        let store = store().await;
        let first = store.create_conversation("alice", Some("first")).await.unwrap();
        let second = store.create_conversation("alice", Some("second")).await.unwrap();
        store.create_conversation("bob", None).await.unwrap();

        let list = store.list_conversations("alice").await.unwrap();
        let ids: Vec<_> = list.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_list_messages_hides_foreign_conversations() {
        let store = store().await;
        let conv = store.create_conversation("alice", None).await.unwrap();
        store
            .append_message(&conv.id, Role::User, NewMessage::text("secret"))
            .await
            .unwrap();

        assert_eq!(store.list_messages("alice", &conv.id).await.unwrap().len(), 1);
        assert!(store.list_messages("bob", &conv.id).await.unwrap().is_empty());
        assert!(store.list_messages("alice", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_checks_ownership() {
        let store = store().await;
        let conv = store.create_conversation("alice", None).await.unwrap();
        store
            .append_message(&conv.id, Role::User, NewMessage::text("hi"))
            .await
            .unwrap();

        assert!(matches!(
            store.delete_conversation("bob", &conv.id).await,
            Err(StoreError::Forbidden)
        ));
        assert!(matches!(
            store.delete_conversation("alice", "missing").await,
            Err(StoreError::NotFound)
        ));

        store.delete_conversation("alice", &conv.id).await.unwrap();
        assert!(store.recent_messages(&conv.id, 10).await.unwrap().is_empty());
        assert!(store.get_conversation("alice", &conv.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_requires_body() {
        let store = store().await;
        let conv = store.create_conversation("alice", None).await.unwrap();
        let err = store
            .append_message(&conv.id, Role::User, NewMessage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_toggle_pin_and_rename() {
        let store = store().await;
        let conv = store.create_conversation("alice", None).await.unwrap();

        assert!(store.toggle_pin("alice", &conv.id).await.unwrap());
        assert!(!store.toggle_pin("alice", &conv.id).await.unwrap());
        assert!(matches!(
            store.toggle_pin("bob", &conv.id).await,
            Err(StoreError::Forbidden)
        ));

        let renamed = store
            .rename_conversation_for("alice", &conv.id, "  \"Quicksort basics\"  ")
            .await
            .unwrap();
        assert_eq!(renamed.name, "Quicksort basics");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("\"Hello\"\nsecond line"), "Hello");
        let long = "x".repeat(150);
        assert_eq!(normalize_name(&long).chars().count(), MAX_NAME_CHARS);
        assert_eq!(normalize_name("ünïcödé"), "ünïcödé");
    }
}
