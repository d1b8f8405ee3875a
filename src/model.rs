use crate::config::ModelConfig;
use crate::conversation::ConversationTurn;
use crate::errors::ModelError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_ERROR_BODY: usize = 512;

/// The language-model collaborator: ordered messages in, text out.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Must preserve message order. Fails with a distinguishable
    /// [`ModelError`] when the service is unreachable or the credential is
    /// missing or rejected.
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[ConversationTurn],
        max_tokens: u32,
    ) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ResponseContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Unsupported,
}

/// Anthropic Messages API client
pub struct AnthropicClient {
    api_key: String,
    messages_url: String,
    model: String,
    client: Client,
}

impl AnthropicClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ModelError::MissingCredential)?
            .to_string();
        let base = config.base_url.trim_end_matches('/');
        let loopback = base.contains("://127.0.0.1") || base.contains("://localhost");
        Ok(Self {
            api_key,
            messages_url: format!("{base}/v1/messages"),
            model: config.model.clone(),
            client: build_client(config.request_timeout, loopback),
        })
    }

    fn build_request<'a>(
        &'a self,
        system_prompt: &'a str,
        messages: &'a [ConversationTurn],
        max_tokens: u32,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            max_tokens,
            system: system_prompt,
            messages: messages
                .iter()
                .map(|turn| Message {
                    role: turn.role().as_str(),
                    content: turn.content(),
                })
                .collect(),
        }
    }
}

fn build_client(timeout: Duration, loopback: bool) -> Client {
    let mut builder = Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90));
    if loopback {
        // a local gateway is never reached through a proxy
        builder = builder.no_proxy();
    }
    builder.build().unwrap_or_else(|_| Client::new())
}

/// Concatenate the text blocks of a response, ignoring anything else
fn collect_text(response: ChatResponse) -> Result<String, ModelError> {
    let texts: Vec<String> = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseContentBlock::Text { text } => Some(text),
            ResponseContentBlock::Unsupported => None,
        })
        .collect();
    if texts.is_empty() {
        return Err(ModelError::MalformedResponse(
            "response contained no text blocks".to_string(),
        ));
    }
    Ok(texts.concat())
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[ConversationTurn],
        max_tokens: u32,
    ) -> Result<String, ModelError> {
        let request = self.build_request(system_prompt, messages, max_tokens);
        debug!(
            "[MODEL] Sending {} messages to {}",
            request.messages.len(),
            self.model
        );

        let response = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("[MODEL] Request to {} failed: {}", self.messages_url, e);
                ModelError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            error!("[MODEL] Credential rejected with {}", status);
            return Err(ModelError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            error!("[MODEL] Service returned {}: {}", status, body);
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        collect_text(parsed)
    }
}
