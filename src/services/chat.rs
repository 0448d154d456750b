use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::Limits;
use crate::error::AppError;
use crate::models::{Conversation, Message, NewMessage, ProviderId, Role};
use crate::providers::{
    ChatMessage, ImageAttachment, ProviderError, ProviderHandle, ProviderRouter, StreamEvent,
};
use crate::services::conversation::ConversationStore;
use crate::services::storage::ObjectStore;
use crate::services::tasks::TaskQueue;
use crate::services::title::TitleGenerator;
use crate::services::validation::{self, NormalizedMessage};

/// Messages sent upstream by background replies.
const REPLY_CONTEXT_MESSAGES: usize = 20;

/// One server-sent event of a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatFrame {
    Token { text: String },
    Done { model: String },
    Error { message: String },
}

/// How the provider side of a turn ended.
#[derive(Debug)]
enum TurnOutcome {
    Completed { text: String },
    Disconnected { partial: String },
    Failed { partial: String, error: ProviderError },
}

/// A validated, routed chat turn ready to stream.
pub struct ChatTurn {
    pub user_id: String,
    pub conversation: Option<Conversation>,
    pub messages: Vec<NormalizedMessage>,
    pub handle: ProviderHandle,
    pub system_prompt: String,
}

#[derive(Clone)]
pub struct ChatService {
    store: ConversationStore,
    files: ObjectStore,
    titles: TitleGenerator,
    tasks: TaskQueue,
    router: Arc<ProviderRouter>,
    limits: Limits,
    system_prompt: String,
}

impl ChatService {
    pub fn new(
        store: ConversationStore,
        files: ObjectStore,
        titles: TitleGenerator,
        tasks: TaskQueue,
        router: Arc<ProviderRouter>,
        limits: Limits,
        system_prompt: String,
    ) -> Self {
        Self {
            store,
            files,
            titles,
            tasks,
            router,
            limits,
            system_prompt,
        }
    }

    /// Start streaming a turn. Waits for the provider's first event, so a
    /// failure before any output comes back as an error instead of a stream.
    /// Persistence of both sides runs in the background in order: user
    /// message, then the reply or a system error message.
    pub async fn stream_turn(&self, turn: ChatTurn) -> Result<ReceiverStream<ChatFrame>, AppError> {
        let chat_messages = validation::to_chat_messages(&turn.messages, self.limits.max_image_size)?;
        let latest = chat_messages.last().cloned();
        let history = trim_history(chat_messages, self.limits.max_history_chars());

        // Only a user turn attached to a conversation is recorded.
        let outcome_tx = match (&turn.conversation, latest) {
            (Some(conversation), Some(latest)) if latest.role == Role::User => {
                let (tx, rx) = oneshot::channel();
                self.tasks.submit(
                    "persist_turn",
                    self.clone().persist_turn(
                        turn.user_id.clone(),
                        conversation.clone(),
                        latest,
                        turn.handle.provider_id(),
                        turn.handle.model.id.to_string(),
                        rx,
                    ),
                );
                Some(tx)
            }
            _ => None,
        };

        let request = turn.handle.build_request(
            history,
            Some(turn.system_prompt),
            Some(self.limits.max_output_tokens),
            None,
        );

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

        let handle = turn.handle.clone();
        let provider_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = provider_cancel.cancelled() => {
                    tracing::debug!("provider stream cancelled");
                }
                result = handle.stream_message(request, tx.clone()) => {
                    if let Err(e) = result {
                        let _ = tx.send(StreamEvent::Error(e)).await;
                    }
                }
            }
        });

        let first = match rx.recv().await {
            Some(StreamEvent::Error(error)) => {
                return Err(Self::fail_early(outcome_tx, error));
            }
            None => {
                let error = ProviderError::InvalidResponse("Stream ended before any output".into());
                return Err(Self::fail_early(outcome_tx, error));
            }
            Some(event) => event,
        };

        let (client_tx, client_rx) = mpsc::channel::<ChatFrame>(64);
        let model = turn.handle.model.id.to_string();
        tokio::spawn(relay(first, rx, client_tx, cancel, model, outcome_tx));

        Ok(ReceiverStream::new(client_rx))
    }

    fn fail_early(outcome_tx: Option<oneshot::Sender<TurnOutcome>>, error: ProviderError) -> AppError {
        tracing::warn!("provider failed before streaming: {}", error);
        if let Some(tx) = outcome_tx {
            let _ = tx.send(TurnOutcome::Failed {
                partial: String::new(),
                error: error.clone(),
            });
        }
        AppError::Upstream(error)
    }

    async fn persist_turn(
        self,
        user_id: String,
        conversation: Conversation,
        latest: ChatMessage,
        provider: ProviderId,
        model: String,
        outcome_rx: oneshot::Receiver<TurnOutcome>,
    ) -> anyhow::Result<()> {
        let user_text = latest.content.clone();
        let user_written = match self.store_user_message(&user_id, &conversation.id, latest).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id, "failed to persist user message: {:#}", e);
                false
            }
        };

        let mut completed = false;
        match outcome_rx.await {
            Ok(TurnOutcome::Completed { text }) => {
                self.save_reply(&conversation.id, &text, &model).await;
                completed = true;
            }
            Ok(TurnOutcome::Disconnected { partial }) => {
                tracing::info!(conversation_id = %conversation.id, "client disconnected mid-stream");
                self.save_reply(&conversation.id, &partial, &model).await;
            }
            Ok(TurnOutcome::Failed { partial, error }) => {
                self.save_reply(&conversation.id, &partial, &model).await;
                self.save_failure(&conversation.id, provider, &error, &model).await;
            }
            Err(_) => {}
        }

        // Only a finished turn earns a title call.
        if completed && user_written && conversation.has_default_name() && !user_text.trim().is_empty() {
            self.titles.schedule(&self.tasks, conversation.id.clone(), user_text);
        }
        Ok(())
    }

    /// Store the first image, if any, then append the user message.
    async fn store_user_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        message: ChatMessage,
    ) -> anyhow::Result<Message> {
        let mut new_message = NewMessage::default();
        if !message.content.trim().is_empty() {
            new_message.text = Some(message.content);
        }
        if let Some(image) = message.images.into_iter().next() {
            let file = self.files.store(user_id, &image.mime_type, image.data).await?;
            new_message.attachment_id = Some(file.id);
        }
        Ok(self
            .store
            .append_message(conversation_id, Role::User, new_message)
            .await?)
    }

    async fn save_reply(&self, conversation_id: &str, text: &str, model: &str) {
        if text.trim().is_empty() {
            return;
        }
        let message = NewMessage::text(text).with_model(model);
        if let Err(e) = self
            .store
            .append_message(conversation_id, Role::Assistant, message)
            .await
        {
            tracing::warn!(conversation_id, "failed to persist assistant message: {:#}", e);
        }
    }

    async fn save_failure(&self, conversation_id: &str, provider: ProviderId, error: &ProviderError, model: &str) {
        let message = NewMessage::error(failure_message(provider, error)).with_model(model);
        if let Err(e) = self
            .store
            .append_message(conversation_id, Role::System, message)
            .await
        {
            tracing::warn!(conversation_id, "failed to persist error message: {:#}", e);
        }
    }

    /// Append a user message through the regular message API. Schedules a
    /// title for a fresh conversation and, with `model_id`, a background
    /// reply.
    pub async fn send_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        text: Option<String>,
        image_id: Option<String>,
        model_id: Option<String>,
    ) -> Result<Message, AppError> {
        let conversation = self.store.owned(user_id, conversation_id).await?;

        if let Some(image_id) = &image_id {
            self.files
                .owned_file(user_id, image_id)
                .await
                .map_err(AppError::Persistence)?
                .ok_or_else(|| AppError::validation("Unknown image"))?;
        }

        let handle = match model_id.as_deref() {
            Some(model_id) => Some(self.router.resolve(model_id)?),
            None => None,
        };

        let text = text.filter(|t| !t.trim().is_empty());
        if let Some(t) = &text {
            if t.chars().count() > self.limits.max_input_chars() {
                return Err(AppError::validation(format!(
                    "Message too long: {} characters, at most {} allowed",
                    t.chars().count(),
                    self.limits.max_input_chars()
                )));
            }
        }

        let message = self
            .store
            .append_message(
                &conversation.id,
                Role::User,
                NewMessage {
                    text: text.clone(),
                    attachment_id: image_id,
                    ..Default::default()
                },
            )
            .await?;

        if conversation.has_default_name() {
            if let Some(text) = text {
                self.titles.schedule(&self.tasks, conversation.id.clone(), text);
            }
        }

        if let Some(handle) = handle {
            self.tasks
                .submit("reply", self.clone().reply_in_background(conversation.id, handle));
        }

        Ok(message)
    }

    /// Non-streaming reply built from the latest messages. Failures become
    /// system messages in the conversation.
    async fn reply_in_background(self, conversation_id: String, handle: ProviderHandle) -> anyhow::Result<()> {
        let context = self.load_context(&conversation_id).await?;
        if context.is_empty() {
            tracing::debug!(conversation_id = %conversation_id, "nothing to reply to");
            return Ok(());
        }

        let request = handle.build_request(
            trim_history(context, self.limits.max_history_chars()),
            Some(self.system_prompt.clone()),
            Some(self.limits.max_output_tokens),
            None,
        );
        let model = handle.model.id;
        match handle.send_message(request).await {
            Ok(response) => self.save_reply(&conversation_id, &response.content, model).await,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, "background reply failed: {}", e);
                self.save_failure(&conversation_id, handle.provider_id(), &e, model).await;
            }
        }
        Ok(())
    }

    async fn load_context(&self, conversation_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let messages = self
            .store
            .recent_messages(conversation_id, REPLY_CONTEXT_MESSAGES)
            .await?;

        let mut context = Vec::with_capacity(messages.len());
        for message in messages.into_iter().filter(|m| !m.is_error) {
            let mut chat = ChatMessage::new(message.author, message.text.unwrap_or_default());
            if message.author == Role::User {
                if let Some(file_id) = &message.attachment_id {
                    if let Some(file) = self.files.get(file_id).await? {
                        chat.images.push(ImageAttachment {
                            mime_type: file.mime_type,
                            data: file.data,
                        });
                    }
                }
            }
            if !chat.content.trim().is_empty() || !chat.images.is_empty() {
                context.push(chat);
            }
        }
        Ok(context)
    }
}

enum Next {
    Event(Option<StreamEvent>),
    ClientGone,
}

/// Forward provider events to the client until either side stops, then
/// report how the turn ended.
async fn relay(
    first: StreamEvent,
    mut rx: mpsc::Receiver<StreamEvent>,
    client_tx: mpsc::Sender<ChatFrame>,
    cancel: CancellationToken,
    model: String,
    outcome_tx: Option<oneshot::Sender<TurnOutcome>>,
) {
    let mut text = String::new();
    let mut pending = Some(first);

    let outcome = loop {
        let next = match pending.take() {
            Some(event) => Next::Event(Some(event)),
            None => tokio::select! {
                _ = client_tx.closed() => Next::ClientGone,
                event = rx.recv() => Next::Event(event),
            },
        };

        match next {
            Next::ClientGone => {
                cancel.cancel();
                break TurnOutcome::Disconnected { partial: text };
            }
            Next::Event(Some(StreamEvent::Token(token))) => {
                text.push_str(&token);
                tracing::trace!(len = token.len(), "token");
                if client_tx.send(ChatFrame::Token { text: token }).await.is_err() {
                    cancel.cancel();
                    break TurnOutcome::Disconnected { partial: text };
                }
            }
            Next::Event(Some(StreamEvent::Done { tokens_in, tokens_out })) => {
                tracing::debug!(?tokens_in, ?tokens_out, "stream complete");
                let _ = client_tx.send(ChatFrame::Done { model: model.clone() }).await;
                break TurnOutcome::Completed { text };
            }
            Next::Event(Some(StreamEvent::Error(error))) => {
                tracing::warn!("provider failed mid-stream: {}", error);
                let _ = client_tx
                    .send(ChatFrame::Error {
                        message: error.to_string(),
                    })
                    .await;
                break TurnOutcome::Failed { partial: text, error };
            }
            Next::Event(None) => {
                if text.is_empty() {
                    let error = ProviderError::InvalidResponse("Stream ended unexpectedly".into());
                    let _ = client_tx
                        .send(ChatFrame::Error {
                            message: error.to_string(),
                        })
                        .await;
                    break TurnOutcome::Failed { partial: text, error };
                }
                let _ = client_tx.send(ChatFrame::Done { model: model.clone() }).await;
                break TurnOutcome::Completed { text };
            }
        }
    };

    if let Some(tx) = outcome_tx {
        let _ = tx.send(outcome);
    }
}

/// Keep the newest messages whose combined text fits in `max_chars`. The
/// newest message is always kept.
pub fn trim_history(messages: Vec<ChatMessage>, max_chars: usize) -> Vec<ChatMessage> {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for message in messages.into_iter().rev() {
        let len = message.content.chars().count();
        if !kept.is_empty() && used + len > max_chars {
            break;
        }
        used += len;
        kept.push(message);
    }
    kept.reverse();
    kept
}

/// Text of the system message recorded when a provider call fails.
pub fn failure_message(provider: ProviderId, error: &ProviderError) -> String {
    match error {
        ProviderError::AuthError(_) => format!(
            "Error: Invalid {} API Key. Please check your {}_API_KEY environment variable.",
            provider.display_name(),
            provider.as_str().to_ascii_uppercase()
        ),
        ProviderError::RateLimited { .. } => {
            "Sorry, the model is receiving too many requests right now. Please try again shortly.".to_string()
        }
        other => format!("Sorry, I encountered an error: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::Database;
    use crate::test_support::{router_with, ScriptedProvider};
    use futures::StreamExt;
    use url::Url;

    struct Harness {
        chat: ChatService,
        store: ConversationStore,
        tasks: TaskQueue,
        router: Arc<ProviderRouter>,
    }

    async fn harness(providers: &[Arc<ScriptedProvider>]) -> Harness {
        let db = Database::new_in_memory().unwrap();
        db.upsert_user("alice", None, None).await.unwrap();
        let store = ConversationStore::new(db.clone());
        let files = ObjectStore::new(db, Url::parse("http://localhost:8080").unwrap(), 1024);
        let router = Arc::new(router_with(providers));
        let tasks = TaskQueue::new();
        let titles = TitleGenerator::new(router.clone(), store.clone(), "gpt-4o-mini");
        let chat = ChatService::new(
            store.clone(),
            files,
            titles,
            tasks.clone(),
            router.clone(),
            Limits::default(),
            "You are a helpful assistant.".into(),
        );
        Harness {
            chat,
            store,
            tasks,
            router,
        }
    }

    fn user(text: &str) -> NormalizedMessage {
        NormalizedMessage {
            role: Role::User,
            text_parts: vec![text.to_string()],
            images: Vec::new(),
        }
    }

    impl Harness {
        fn turn(&self, conversation: Option<Conversation>, model: &str, text: &str) -> ChatTurn {
            ChatTurn {
                user_id: "alice".into(),
                conversation,
                messages: vec![user(text)],
                handle: self.router.resolve(model).unwrap(),
                system_prompt: "You are a helpful assistant.".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_persists_both_sides_and_titles() {
        let provider = Arc::new(ScriptedProvider::tokens(ProviderId::OpenAi, &["Quick", "sort"]));
        let h = harness(&[provider.clone()]).await;
        let conv = h.store.create_conversation("alice", None).await.unwrap();

        let stream = h
            .chat
            .stream_turn(h.turn(Some(conv.clone()), "gpt-4o-mini", "Explain quicksort"))
            .await
            .unwrap();
        let frames: Vec<ChatFrame> = stream.collect().await;
        assert_eq!(
            frames,
            vec![
                ChatFrame::Token { text: "Quick".into() },
                ChatFrame::Token { text: "sort".into() },
                ChatFrame::Done { model: "gpt-4o-mini".into() },
            ]
        );

        h.tasks.idle().await;
        let messages = h.store.list_messages("alice", &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author, Role::User);
        assert_eq!(messages[0].text.as_deref(), Some("Explain quicksort"));
        assert_eq!(messages[1].author, Role::Assistant);
        assert_eq!(messages[1].text.as_deref(), Some("Quicksort"));
        assert_eq!(messages[1].model.as_deref(), Some("gpt-4o-mini"));

        // The same scripted provider answers the title request.
        let conv = h.store.get_conversation("alice", &conv.id).await.unwrap().unwrap();
        assert_eq!(conv.name, "Quicksort");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_records_system_message() {
        let provider = Arc::new(ScriptedProvider::failing(
            ProviderId::Anthropic,
            ProviderError::AuthError("Invalid API key".into()),
        ));
        let h = harness(&[provider]).await;
        let conv = h.store.create_conversation("alice", Some("Existing")).await.unwrap();

        let result = h
            .chat
            .stream_turn(h.turn(Some(conv.clone()), "claude-3-haiku-20240307", "Hello"))
            .await;
        assert!(matches!(result, Err(AppError::Upstream(ProviderError::AuthError(_)))));

        h.tasks.idle().await;
        let messages = h.store.list_messages("alice", &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        let system = &messages[1];
        assert_eq!(system.author, Role::System);
        assert!(system.is_error);
        assert!(system.text.as_deref().unwrap().contains("Invalid Anthropic API Key"));
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_default_name() {
        let provider = Arc::new(ScriptedProvider::failing(
            ProviderId::OpenAi,
            ProviderError::AuthError("Invalid API key".into()),
        ));
        let h = harness(&[provider.clone()]).await;
        let conv = h.store.create_conversation("alice", None).await.unwrap();
        assert!(conv.has_default_name());

        let result = h
            .chat
            .stream_turn(h.turn(Some(conv.clone()), "gpt-4o-mini", "Plan a trip to Lisbon"))
            .await;
        assert!(result.is_err());

        h.tasks.idle().await;
        assert_eq!(provider.calls(), 1);
        let conv = h.store.get_conversation("alice", &conv.id).await.unwrap().unwrap();
        assert!(conv.has_default_name());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_keeps_partial_text() {
        let provider = Arc::new(ScriptedProvider::endless(ProviderId::OpenAi, "la "));
        let h = harness(&[provider]).await;
        let conv = h.store.create_conversation("alice", Some("Song")).await.unwrap();

        let mut stream = h
            .chat
            .stream_turn(h.turn(Some(conv.clone()), "gpt-4o-mini", "Sing"))
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first, ChatFrame::Token { text: "la ".into() });
        drop(stream);

        h.tasks.idle().await;
        let messages = h.store.list_messages("alice", &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].author, Role::Assistant);
        assert!(messages[1].text.as_deref().unwrap().starts_with("la"));
    }

    #[tokio::test]
    async fn test_without_conversation_nothing_is_stored() {
        let provider = Arc::new(ScriptedProvider::tokens(ProviderId::OpenAi, &["hi"]));
        let h = harness(&[provider]).await;

        let stream = h
            .chat
            .stream_turn(h.turn(None, "gpt-4o-mini", "Hello"))
            .await
            .unwrap();
        let frames: Vec<ChatFrame> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        h.tasks.idle().await;
        assert!(h.store.list_conversations("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_with_background_reply() {
        let provider = Arc::new(ScriptedProvider::tokens(ProviderId::OpenAi, &["Sure."]));
        let h = harness(&[provider.clone()]).await;
        let conv = h.store.create_conversation("alice", Some("Named")).await.unwrap();

        h.chat
            .send_message("alice", &conv.id, Some("Hi there".into()), None, Some("gpt-4o-mini".into()))
            .await
            .unwrap();
        h.tasks.idle().await;

        let messages = h.store.list_messages("alice", &conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text.as_deref(), Some("Sure."));
        assert_eq!(provider.calls(), 1);
        let request = provider.last_request().unwrap();
        assert_eq!(request.messages.last().unwrap().content, "Hi there");
    }

    #[tokio::test]
    async fn test_send_message_checks_ownership_and_model() {
        let provider = Arc::new(ScriptedProvider::tokens(ProviderId::OpenAi, &["x"]));
        let h = harness(&[provider.clone()]).await;
        let conv = h.store.create_conversation("alice", None).await.unwrap();

        let err = h
            .chat
            .send_message("mallory", &conv.id, Some("hi".into()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = h
            .chat
            .send_message("alice", &conv.id, Some("hi".into()), None, Some("gpt-9".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)));

        let err = h
            .chat
            .send_message("alice", &conv.id, Some("hi".into()), Some("nope".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationFailed(_)));

        h.tasks.idle().await;
        assert!(h.store.list_messages("alice", &conv.id).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn test_trim_history_keeps_newest() {
        let messages = vec![
            ChatMessage::new(Role::User, "aaaa"),
            ChatMessage::new(Role::Assistant, "bbbb"),
            ChatMessage::new(Role::User, "cccccccccc"),
        ];
        let kept = trim_history(messages.clone(), 14);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "bbbb");

        let kept = trim_history(messages, 3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].content, "cccccccccc");
    }

    #[test]
    fn test_failure_message() {
        let msg = failure_message(ProviderId::OpenAi, &ProviderError::AuthError("x".into()));
        assert_eq!(
            msg,
            "Error: Invalid OpenAI API Key. Please check your OPENAI_API_KEY environment variable."
        );
        let msg = failure_message(ProviderId::Google, &ProviderError::RequestFailed("HTTP 500".into()));
        assert!(msg.starts_with("Sorry, I encountered an error"));
    }
}
