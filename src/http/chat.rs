use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::auth::AuthUser;
use super::cors;
use super::state::AppState;
use crate::error::AppError;
use crate::services::chat::{ChatFrame, ChatTurn};
use crate::services::preferences::personalize_prompt;
use crate::services::validation::{self, InboundMessage, ValidationError};

const CONVERSATION_HEADER: &str = "x-conversation-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    messages: Option<Vec<InboundMessage>>,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// `POST /chat`. Every response, errors included, carries the CORS headers,
/// so the body is buffered here after auth instead of by an extractor.
pub async fn chat(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let response = match start_chat(&state, &parts.headers, body).await {
        Ok(sse) => sse.into_response(),
        Err(e) => e.into_response(),
    };
    cors::with_cors(&state.config, &parts.headers, response)
}

pub async fn preflight(State(state): State<AppState>, headers: HeaderMap) -> Response {
    cors::preflight(&state.config, &headers)
}

async fn start_chat(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let user = AuthUser::from_headers(headers, state).await?;

    let max = super::body_limit(&state.config.limits);
    let body = axum::body::to_bytes(body, max).await.map_err(|e| {
        tracing::debug!(user_id = user.id(), "chat body rejected: {}", e);
        ValidationError::BodyTooLarge { max }
    })?;

    let body: ChatBody = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!("unreadable chat body: {}", e);
        ValidationError::MissingMessages
    })?;
    let messages = body.messages.ok_or(ValidationError::MissingMessages)?;
    let messages = validation::validate_messages(&messages, &state.config.limits)?;

    let model_id = body.model_id.unwrap_or_default();
    let handle = state.router.resolve(&model_id)?;
    if let Some(last) = messages.last() {
        validation::check_model_support(handle.model, last)?;
    }

    let conversation_id = headers
        .get(CONVERSATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.id)
        .filter(|id| !id.trim().is_empty());
    let conversation = match conversation_id {
        Some(id) => Some(
            state
                .store
                .get_conversation(user.id(), &id)
                .await
                .map_err(AppError::Persistence)?
                .ok_or_else(|| AppError::not_found("Conversation not found"))?,
        ),
        None => None,
    };

    let prefs = state.preferences.load(user.id()).await.unwrap_or_else(|e| {
        tracing::warn!(user_id = user.id(), "failed to load preferences: {:#}", e);
        Default::default()
    });
    let system_prompt = personalize_prompt(&state.config.system_prompt, &prefs);

    tracing::info!(
        user_id = user.id(),
        model = handle.model.id,
        conversation_id = conversation.as_ref().map(|c| c.id.as_str()),
        "chat turn"
    );

    let frames = state
        .chat
        .stream_turn(ChatTurn {
            user_id: user.id().to_string(),
            conversation,
            messages,
            handle,
            system_prompt,
        })
        .await?;

    let events = frames.map(|frame: ChatFrame| Event::default().json_data(frame));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
