use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::models::{AnthropicDelta, AnthropicStreamEvent};
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
    let mut tokens_in: Option<i64> = None;
    let mut tokens_out: Option<i64> = None;

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
            match serde_json::from_str::<AnthropicStreamEvent>(&data) {
                Ok(AnthropicStreamEvent::MessageStart { message }) => {
                    if let Some(usage) = message.usage {
                        tokens_in = usage.input_tokens;
                    }
                }
                Ok(AnthropicStreamEvent::ContentBlockDelta { delta }) => {
                    if let AnthropicDelta::TextDelta { text } = delta {
                        if tx.send(StreamEvent::Token(text)).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                Ok(AnthropicStreamEvent::MessageDelta { usage }) => {
                    if let Some(usage) = usage {
                        tokens_out = usage.output_tokens;
                    }
                }
                Ok(AnthropicStreamEvent::MessageStop {}) => {
                    let _ = tx
                        .send(StreamEvent::Done {
                            tokens_in,
                            tokens_out,
                        })
                        .await;
                    return;
                }
                Ok(AnthropicStreamEvent::Error { error }) => {
                    let err = if error.error_type == "authentication_error" {
                        ProviderError::AuthError(error.message)
                    } else {
                        ProviderError::RequestFailed(error.message)
                    };
                    let _ = tx.send(StreamEvent::Error(err)).await;
                    return;
                }
                Ok(AnthropicStreamEvent::Ignored) => {}
                Err(e) => {
                    tracing::warn!("Failed to parse Anthropic SSE data: {}", e);
                }
            }
        }
    }

    // Stream ended without message_stop
    let _ = tx
        .send(StreamEvent::Done {
            tokens_in,
            tokens_out,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static str>) -> Vec<StreamEvent> {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(c.as_bytes().to_vec())),
        );
        let (tx, mut rx) = mpsc::channel(32);
        parse_sse_stream(stream, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_text_deltas_and_usage() {
        let events = collect(vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m\",\"usage\":{\"input_tokens\":7}}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        ])
        .await;

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done {
                tokens_in: Some(7),
                tokens_out: Some(2)
            })
        ));
    }

    #[tokio::test]
    async fn test_error_event() {
        let events = collect(vec![
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::Error(ProviderError::RequestFailed(m)) if m == "Overloaded"
        ));
    }
}
