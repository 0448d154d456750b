use std::sync::Arc;

use anyhow::{Context, Result};

use crate::models::Role;
use crate::providers::{ChatMessage, ProviderRouter};
use crate::services::conversation::{normalize_name, ConversationStore};
use crate::services::tasks::TaskQueue;

const TITLE_PROMPT: &str = "You are an expert at creating concise conversation titles. \
Based on the following user message, generate a title that is 5 words or less. \
Only respond with the title, no quotes or explanations.";
const TITLE_MAX_TOKENS: u32 = 20;
const TITLE_TEMPERATURE: f32 = 0.3;

/// Names a fresh conversation after its first user message.
#[derive(Clone)]
pub struct TitleGenerator {
    router: Arc<ProviderRouter>,
    store: ConversationStore,
    model_id: String,
}

impl TitleGenerator {
    pub fn new(router: Arc<ProviderRouter>, store: ConversationStore, model_id: impl Into<String>) -> Self {
        Self {
            router,
            store,
            model_id: model_id.into(),
        }
    }

    /// Queue a rename. Failures only reach the log; the conversation keeps
    /// its current name.
    pub fn schedule(&self, tasks: &TaskQueue, conversation_id: String, first_message: String) {
        let this = self.clone();
        tasks.submit("title", async move {
            this.run(&conversation_id, &first_message).await
        });
    }

    pub async fn run(&self, conversation_id: &str, first_message: &str) -> Result<()> {
        let title = self.generate(first_message).await?;
        self.store
            .rename_conversation(conversation_id, &title)
            .await
            .context("Failed to store conversation title")?;
        tracing::debug!(conversation_id, title = %title, "conversation titled");
        Ok(())
    }

    pub async fn generate(&self, first_message: &str) -> Result<String> {
        let handle = self.router.resolve(&self.model_id)?;
        let request = handle.build_request(
            vec![ChatMessage::new(Role::User, first_message)],
            Some(TITLE_PROMPT.to_string()),
            Some(TITLE_MAX_TOKENS),
            Some(TITLE_TEMPERATURE),
        );
        let response = handle.send_message(request).await?;

        let title = normalize_name(&response.content);
        anyhow::ensure!(!title.is_empty(), "title model returned no text");
        Ok(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderId;
    use crate::providers::ProviderError;
    use crate::services::database::Database;
    use crate::test_support::{router_with, ScriptedProvider};

    async fn setup(provider: ScriptedProvider) -> (TitleGenerator, ConversationStore, Arc<ScriptedProvider>) {
        let db = Database::new_in_memory().unwrap();
        db.upsert_user("alice", None, None).await.unwrap();
        let store = ConversationStore::new(db);
        let provider = Arc::new(provider);
        let router = Arc::new(router_with(&[provider.clone()]));
        (TitleGenerator::new(router, store.clone(), "gpt-4o-mini"), store, provider)
    }

    #[tokio::test]
    async fn test_title_replaces_default_name() {
        let (titles, store, provider) =
            setup(ScriptedProvider::tokens(ProviderId::OpenAi, &["\"Quicksort ", "Explained\""])).await;
        let conv = store.create_conversation("alice", None).await.unwrap();

        titles.run(&conv.id, "Explain quicksort").await.unwrap();

        let conv = store.get_conversation("alice", &conv.id).await.unwrap().unwrap();
        assert_eq!(conv.name, "Quicksort Explained");
        let request = provider.last_request().unwrap();
        assert_eq!(request.max_tokens, Some(20));
        assert_eq!(request.messages[0].content, "Explain quicksort");
    }

    #[tokio::test]
    async fn test_failure_keeps_default_name() {
        let (titles, store, _) = setup(ScriptedProvider::failing(
            ProviderId::OpenAi,
            ProviderError::NetworkError("connection refused".into()),
        ))
        .await;
        let conv = store.create_conversation("alice", None).await.unwrap();

        let tasks = TaskQueue::new();
        titles.schedule(&tasks, conv.id.clone(), "Explain quicksort".into());
        tasks.idle().await;

        let conv = store.get_conversation("alice", &conv.id).await.unwrap().unwrap();
        assert_eq!(conv.name, "New Chat");
    }
}
