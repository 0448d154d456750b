use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ChatResponse, ProviderError, StreamEvent};
use crate::models::ProviderId;

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream a reply into `tx`. Errors that happen before the first byte of
    /// the body are returned; errors after that are sent as
    /// `StreamEvent::Error`. Returns early once `tx` is closed.
    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}
