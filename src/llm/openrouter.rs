//! OpenRouter (OpenAI 호환) 텍스트 완성
//!
//! ref: https://openrouter.ai/docs/api-reference/chat-completion

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{approx_tokens, ensure_fits, CompletionProvider};
use crate::config::CompletionConfig;

/// OpenAI 호환 chat completions 구현체
#[derive(Debug)]
pub struct OpenRouterCompletion {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    context_window: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            context_window: config.context_window,
            client,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        ensure_fits(prompt, self.context_window)?;

        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("OPENROUTER_API_KEY not set"))?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            // 남은 윈도우만큼만 생성
            max_tokens: self
                .context_window
                .saturating_sub(approx_tokens(prompt))
                .max(1),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .context("Failed to reach OpenRouter")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read OpenRouter response body")?;

        if !status.is_success() {
            anyhow::bail!("OpenRouter error ({}): {}", status, body);
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse OpenRouter response")?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("OpenRouter returned no completion"))
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn name(&self) -> &str {
        &self.model
    }
}
