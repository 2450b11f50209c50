//! 텍스트 완성 모듈
//!
//! 관련성 판정과 답변 합성이 같은 request/response 계약으로 사용하는
//! 텍스트 완성 서비스입니다.
//!
//! - Ollama: 로컬 `/api/generate`
//! - OpenRouter: OpenAI 호환 `/chat/completions`

mod ollama;
mod openrouter;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{CompletionConfig, ProviderKind};

pub use ollama::OllamaCompletion;
pub use openrouter::OpenRouterCompletion;

/// 토큰당 문자 수 근사치
pub const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// CompletionProvider Trait
// ============================================================================

/// 텍스트 완성 프로바이더 트레이트
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// 프롬프트 완성
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// 컨텍스트 윈도우 (토큰 근사치)
    fn context_window(&self) -> usize;

    /// 프로바이더/모델 이름
    fn name(&self) -> &str;
}

/// 설정으로 프로바이더 생성
pub fn create_completion(config: &CompletionConfig) -> Result<Arc<dyn CompletionProvider>> {
    let provider: Arc<dyn CompletionProvider> = match config.provider {
        ProviderKind::Ollama => Arc::new(OllamaCompletion::new(config)?),
        ProviderKind::OpenRouter => Arc::new(OpenRouterCompletion::new(config)?),
    };
    tracing::info!("Using completion model {}", provider.name());
    Ok(provider)
}

// ============================================================================
// Context Window
// ============================================================================

/// 텍스트의 토큰 수 근사치
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// 프롬프트가 컨텍스트 윈도우를 넘으면 거부
pub fn ensure_fits(prompt: &str, context_window: usize) -> Result<()> {
    let tokens = approx_tokens(prompt);
    if tokens > context_window {
        anyhow::bail!(
            "Prompt too long: ~{} tokens exceeds context window of {}",
            tokens,
            context_window
        );
    }
    Ok(())
}

/// 토큰 예산에 맞게 앞부분만 남김 (문자 경계 유지)
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// Tests
// ============================================================================
