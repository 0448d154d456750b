use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::sync::mpsc;

use crate::config::ProviderCredentials;
use crate::models::ProviderId;
use crate::providers::{AiProvider, ChatRequest, ChatResponse, ProviderError, ProviderRouter, StreamEvent};
use crate::services::auth::Claims;

pub const TEST_SECRET: &str = "test-secret-with-enough-bytes-for-hs256";

pub fn issue_token(secret: &str, sub: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        email: Some(format!("{}@example.com", sub)),
        name: None,
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}

enum Script {
    Tokens(Vec<String>),
    Fail(ProviderError),
    Endless(String),
}

/// In-process provider that replays a fixed script.
pub struct ScriptedProvider {
    id: ProviderId,
    script: Script,
    calls: AtomicUsize,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(id: ProviderId, script: Script) -> Self {
        Self {
            id,
            script,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn tokens(id: ProviderId, tokens: &[&str]) -> Self {
        Self::new(id, Script::Tokens(tokens.iter().map(|t| t.to_string()).collect()))
    }

    /// Fails before producing any output.
    pub fn failing(id: ProviderId, error: ProviderError) -> Self {
        Self::new(id, Script::Fail(error))
    }

    /// Streams `token` until the receiver goes away.
    pub fn endless(id: ProviderId, token: &str) -> Self {
        Self::new(id, Script::Endless(token.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn record(&self, request: &ChatRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn provider_id(&self) -> ProviderId {
        self.id
    }

    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.record(&request);
        match &self.script {
            Script::Tokens(tokens) => Ok(ChatResponse {
                content: tokens.concat(),
                model: request.model,
                tokens_in: None,
                tokens_out: None,
            }),
            Script::Fail(error) => Err(error.clone()),
            Script::Endless(token) => Ok(ChatResponse {
                content: token.clone(),
                model: request.model,
                tokens_in: None,
                tokens_out: None,
            }),
        }
    }

    async fn stream_message(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.record(&request);
        match &self.script {
            Script::Tokens(tokens) => {
                for token in tokens {
                    if tx.send(StreamEvent::Token(token.clone())).await.is_err() {
                        return Ok(());
                    }
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        tokens_in: Some(1),
                        tokens_out: Some(tokens.len() as i64),
                    })
                    .await;
                Ok(())
            }
            Script::Fail(error) => Err(error.clone()),
            Script::Endless(token) => {
                while tx.send(StreamEvent::Token(token.clone())).await.is_ok() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(())
            }
        }
    }
}

pub fn router_with(providers: &[Arc<ScriptedProvider>]) -> ProviderRouter {
    let mut router = ProviderRouter::new();
    for provider in providers {
        router.register(
            provider.clone(),
            ProviderCredentials {
                api_key: "test-key".into(),
                base_url: None,
            },
        );
    }
    router
}
