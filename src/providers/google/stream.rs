use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::GeminiResponse;
use crate::providers::sse::SseDecoder;
use crate::providers::types::{ProviderError, StreamEvent};

pub async fn parse_sse_stream<S, B, E>(stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut last_tokens_in: Option<i64> = None;
    let mut last_tokens_out: Option<i64> = None;

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::NetworkError(format!(
                        "Stream error: {}",
                        e
                    ))))
                    .await;
                return;
            }
        };

        for data in decoder.push(bytes.as_ref()) {
            let response = match serde_json::from_str::<GeminiResponse>(&data) {
                Ok(r) => r,
                Err(e) => {
                    // Partial events may occur; keep going.
                    tracing::warn!("Failed to parse Gemini SSE data: {}", e);
                    continue;
                }
            };

            if let Some(error) = &response.error {
                let msg = error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string());
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::RequestFailed(msg)))
                    .await;
                return;
            }

            if let Some(text) = response.text() {
                if tx.send(StreamEvent::Token(text)).await.is_err() {
                    return; // receiver dropped
                }
            }

            // The last chunk usually carries the totals.
            if let Some(usage) = &response.usage_metadata {
                if usage.prompt_token_count.is_some() {
                    last_tokens_in = usage.prompt_token_count;
                }
                if usage.candidates_token_count.is_some() {
                    last_tokens_out = usage.candidates_token_count;
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            tokens_in: last_tokens_in,
            tokens_out: last_tokens_out,
        })
        .await;
}
