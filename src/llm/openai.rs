//! OpenAI-compatible `/chat/completions` provider (DeepSeek, Moonshot/Kimi, ...).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ModelProvider, ModelRequest, ModelResponse, TokenUsage};
use crate::config::ProviderSpec;
use crate::errors::ModelError;

pub struct OpenAiProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key_env: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(name: &str, spec: &ProviderSpec) -> Result<Self> {
        let base_url = spec
            .base_url
            .clone()
            .with_context(|| format!("provider '{}' has no base_url", name))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(spec.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            client,
            base_url,
            api_key_env: spec.api_key_env.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn api_key(&self) -> Result<Option<String>, ModelError> {
        let Some(var) = &self.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(ModelError::Provider {
                provider: self.name.clone(),
                message: format!("{} is not set", var),
            }),
        }
    }

    fn body<'a>(request: &'a ModelRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        ChatRequest {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json.then_some(ResponseFormat { kind: "json_object" }),
        }
    }

    fn parse(&self, response: ChatResponse) -> Result<ModelResponse, ModelError> {
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ModelError::InvalidResponse {
                provider: self.name.clone(),
                message: "response has no message content".into(),
            })?;
        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(ModelResponse { content, usage })
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let mut builder = self.client.post(self.endpoint()).json(&Self::body(request));
        if let Some(key) = self.api_key()? {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout {
                    provider: self.name.clone(),
                }
            } else {
                ModelError::Provider {
                    provider: self.name.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Provider {
                provider: self.name.clone(),
                message: format!("HTTP {}: {}", status, body.chars().take(500).collect::<String>()),
            });
        }

        let parsed = response
            .json::<ChatResponse>()
            .await
            .map_err(|e| ModelError::InvalidResponse {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        self.parse(parsed)
    }
}
