//! Ollama 텍스트 완성
//!
//! ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-completion

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ensure_fits, CompletionProvider};
use crate::config::CompletionConfig;

/// 로컬 Ollama 서버 완성 구현체
#[derive(Debug)]
pub struct OllamaCompletion {
    endpoint: String,
    model: String,
    name: String,
    context_window: usize,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            name: format!("ollama/{}", config.model),
            context_window: config.context_window,
            client,
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        ensure_fits(prompt, self.context_window)?;

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                num_ctx: self.context_window,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&request)
            .send()
            .await
            .context("Failed to reach Ollama")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read Ollama response body")?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OllamaError>(&body) {
                anyhow::bail!("Ollama error ({}): {}", status, error.error);
            }
            anyhow::bail!("Ollama error ({}): {}", status, body);
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("Failed to parse Ollama response")?;
        Ok(parsed.response)
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn name(&self) -> &str {
        &self.name
    }
}
