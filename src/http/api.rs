use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::AuthUser;
use super::state::AppState;
use crate::error::AppError;
use crate::models::{Conversation, Message, User, UserPreferences};
use crate::providers::registry::{self, ModelConfig};
use crate::services::images::ImageResult;
use crate::services::preferences::{is_enabled, unknown_models};

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// The caller's own row, plan and credits included.
pub async fn me(user: AuthUser) -> Json<User> {
    Json(user.0)
}

// --- Models and preferences ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelView {
    #[serde(flatten)]
    pub model: &'static ModelConfig,
    pub enabled: bool,
    pub available: bool,
}

pub async fn list_models(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<ModelView>>, AppError> {
    let prefs = state.preferences.load(user.id()).await?;
    let models = registry::all_models()
        .iter()
        .map(|model| ModelView {
            model,
            enabled: is_enabled(&prefs, model.id),
            available: state.router.is_configured(model.provider),
        })
        .collect();
    Ok(Json(models))
}

pub async fn get_preferences(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<UserPreferences>, AppError> {
    Ok(Json(state.preferences.load(user.id()).await?))
}

pub async fn put_preferences(
    State(state): State<AppState>,
    user: AuthUser,
    Json(prefs): Json<UserPreferences>,
) -> Result<Json<UserPreferences>, AppError> {
    let unknown = unknown_models(&prefs);
    if !unknown.is_empty() {
        return Err(AppError::validation(format!("Unknown models: {}", unknown.join(", "))));
    }
    state.preferences.save(user.id(), &prefs).await?;
    Ok(Json(prefs))
}

// --- Conversations ---

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversation {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    body: Option<Json<CreateConversation>>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let conversation = state
        .store
        .create_conversation(user.id(), body.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Conversation>>, AppError> {
    Ok(Json(state.store.list_conversations(user.id()).await?))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, AppError> {
    state
        .store
        .get_conversation(user.id(), &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found("Conversation not found"))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.delete_conversation(user.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RenameConversation {
    pub name: String,
}

pub async fn rename_conversation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<RenameConversation>,
) -> Result<Json<Conversation>, AppError> {
    let conversation = state
        .store
        .rename_conversation_for(user.id(), &id, &body.name)
        .await?;
    Ok(Json(conversation))
}

pub async fn toggle_pin(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pinned = state.store.toggle_pin(user.id(), &id).await?;
    Ok(Json(json!({ "pinned": pinned })))
}

// --- Messages ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub image_url: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageView>>, AppError> {
    let messages = state.store.list_messages(user.id(), &id).await?;
    let views = messages
        .into_iter()
        .map(|message| MessageView {
            image_url: message.attachment_id.as_deref().map(|f| state.files.file_url(f)),
            message,
        })
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

pub async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<SendMessage>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let message = state
        .chat
        .send_message(user.id(), &id, body.text, body.image_id, body.model_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
pub struct GenerateImage {
    pub prompt: String,
}

pub async fn generate_image(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<GenerateImage>,
) -> Result<Json<ImageResult>, AppError> {
    Ok(Json(state.images.generate(user.id(), &id, &body.prompt).await?))
}

// --- Uploads and files ---

pub async fn create_upload_url(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let url = state.files.create_upload_url(user.id()).await?;
    Ok(Json(json!({ "uploadUrl": url })))
}

/// The ticket in the path is the credential; no bearer token needed.
pub async fn upload(
    State(state): State<AppState>,
    Path(ticket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let file = state
        .files
        .accept_upload(&ticket, content_type, body.to_vec())
        .await?;
    Ok(Json(json!({ "storageId": file.id })))
}

pub async fn download(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let file = state
        .files
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found("File not found"))?;
    let content_type = HeaderValue::from_str(&file.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(([(CONTENT_TYPE, content_type)], file.data).into_response())
}
