use serde::Serialize;

use crate::config::ProviderCredentials;
use crate::error::AppError;
use crate::models::{NewMessage, Role};
use crate::providers::openai::OpenAiProvider;
use crate::providers::ProviderError;
use crate::services::conversation::ConversationStore;
use crate::services::storage::ObjectStore;

const IMAGE_MODEL: &str = "dall-e-3";
const NOTICE_MODEL: &str = "system-info";
const IMAGE_MIME: &str = "image/png";

const NO_KEY_NOTICE: &str = "Image generation requires an OpenAI API key. \
Set OPENAI_API_KEY in the server environment to enable it.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            storage_id: None,
            error: Some(error.into()),
        }
    }
}

/// Generates images with OpenAI and posts them into a conversation.
pub struct ImageService {
    provider: OpenAiProvider,
    credentials: Option<ProviderCredentials>,
    store: ConversationStore,
    files: ObjectStore,
}

impl ImageService {
    pub fn new(
        provider: OpenAiProvider,
        credentials: Option<ProviderCredentials>,
        store: ConversationStore,
        files: ObjectStore,
    ) -> Self {
        Self {
            provider,
            credentials,
            store,
            files,
        }
    }

    /// Generate an image for `prompt` in a conversation `owner_id` owns.
    /// Provider failures are recorded in the conversation and reported as
    /// `success: false`, not as errors.
    pub async fn generate(&self, owner_id: &str, conversation_id: &str, prompt: &str) -> Result<ImageResult, AppError> {
        let conversation = self.store.owned(owner_id, conversation_id).await?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::validation("Prompt must not be empty"));
        }

        let Some(credentials) = &self.credentials else {
            tracing::warn!("image generation requested without an OpenAI key");
            let notice = NewMessage::error(NO_KEY_NOTICE).with_model(NOTICE_MODEL);
            self.store
                .append_message(&conversation.id, Role::System, notice)
                .await?;
            return Ok(ImageResult::failed("Image generation is not configured"));
        };

        let bytes = match self
            .provider
            .generate_image(&credentials.api_key, credentials.base_url.as_deref(), prompt)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id, "image generation failed: {}", e);
                let notice = NewMessage::error(image_failure_message(&e)).with_model(IMAGE_MODEL);
                self.store
                    .append_message(&conversation.id, Role::System, notice)
                    .await?;
                return Ok(ImageResult::failed(e.to_string()));
            }
        };

        let file = self.files.store(owner_id, IMAGE_MIME, bytes).await?;
        let message = NewMessage::text(format!("Here's the image I generated for: \"{}\"", prompt))
            .with_attachment(file.id.clone())
            .with_model(IMAGE_MODEL);
        self.store
            .append_message(&conversation.id, Role::Assistant, message)
            .await?;

        tracing::info!(conversation_id = %conversation.id, file_id = %file.id, "image generated");
        Ok(ImageResult {
            success: true,
            storage_id: Some(file.id),
            error: None,
        })
    }
}

fn image_failure_message(error: &ProviderError) -> String {
    match error {
        ProviderError::AuthError(_) => "Error: Invalid OpenAI API Key for image generation. \
Please check your OPENAI_API_KEY environment variable."
            .to_string(),
        other => format!("Sorry, I couldn't generate an image: {}", other),
    }
}
