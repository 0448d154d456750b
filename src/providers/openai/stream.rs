use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::OpenAiStreamChunk;
use crate::providers::sse::SseDecoder;
use crate::providers::types::{ProviderError, StreamEvent};

enum Step {
    Continue,
    Finished,
}

pub async fn parse_sse_stream<S, B, E>(stream: S, tx: mpsc::Sender<StreamEvent>)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut usage = (None, None);
    let mut finished = false;

    'read: while let Some(chunk_result) = stream.next().await {
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
            match handle_data(&data, &tx, &mut usage).await {
                Some(Step::Continue) => {}
                Some(Step::Finished) => {
                    finished = true;
                    break 'read;
                }
                None => return,
            }
        }
    }

    if let Some(data) = decoder.finish().filter(|_| !finished) {
        if handle_data(&data, &tx, &mut usage).await.is_none() {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            tokens_in: usage.0,
            tokens_out: usage.1,
        })
        .await;
}

/// Returns `None` once the stream should stop without a trailing `Done`.
async fn handle_data(
    data: &str,
    tx: &mpsc::Sender<StreamEvent>,
    usage: &mut (Option<i64>, Option<i64>),
) -> Option<Step> {
    if data.trim() == "[DONE]" {
        return Some(Step::Finished);
    }

    let chunk = match serde_json::from_str::<OpenAiStreamChunk>(data) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to parse OpenAI SSE data: {}", e);
            return Some(Step::Continue);
        }
    };

    if let Some(error) = chunk.error {
        let is_auth = error
            .code
            .as_ref()
            .and_then(|c| c.as_str())
            .is_some_and(|c| c == "invalid_api_key");
        let err = if is_auth {
            ProviderError::AuthError(error.message)
        } else {
            ProviderError::RequestFailed(error.message)
        };
        let _ = tx.send(StreamEvent::Error(err)).await;
        return None;
    }

    if let Some(u) = chunk.usage {
        *usage = (u.prompt_tokens, u.completion_tokens);
    }

    for choice in chunk.choices {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() && tx.send(StreamEvent::Token(text)).await.is_err() {
                return None; // receiver dropped
            }
        }
    }

    Some(Step::Continue)
}
