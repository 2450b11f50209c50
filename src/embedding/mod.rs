//! 임베딩 모듈 - 텍스트 벡터화
//!
//! 고정된 모델 레지스트리에서 이름으로 임베딩 모델을 선택합니다.
//! 모델은 Hugging Face Text Embeddings Inference 호환 서버(`POST /embed`)로 서빙됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = load_embed_model("BAAI_bge", &config.embedding)?;
//! let embedding = embedder.embed("Patient has stage 2 hypertension.").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 고정 길이 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Model Registry
// ============================================================================

/// 레지스트리 엔트리
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingModelSpec {
    /// 짧은 이름 (설정에서 사용)
    pub name: &'static str,
    /// Hugging Face 모델 ID
    pub model_id: &'static str,
    pub dimension: usize,
}

/// 알려진 임베딩 모델 목록
const EMBED_MODELS: &[EmbeddingModelSpec] = &[
    EmbeddingModelSpec {
        name: "mpnet",
        model_id: "sentence-transformers/all-mpnet-base-v2",
        dimension: 768,
    },
    EmbeddingModelSpec {
        name: "minilm",
        model_id: "sentence-transformers/all-MiniLM-L6-v2",
        dimension: 384,
    },
    EmbeddingModelSpec {
        name: "distilroberta",
        model_id: "sentence-transformers/all-distilroberta-v1",
        dimension: 768,
    },
    EmbeddingModelSpec {
        name: "MedEmbed",
        model_id: "abhinand/MedEmbed-base-v0.1",
        dimension: 768,
    },
    EmbeddingModelSpec {
        name: "BAAI_bge",
        model_id: "BAAI/bge-base-en-v1.5",
        dimension: 768,
    },
    EmbeddingModelSpec {
        name: "MiniLM",
        model_id: "sentence-transformers/all-MiniLM-L6-v2",
        dimension: 384,
    },
    EmbeddingModelSpec {
        name: "GTE_base",
        model_id: "thenlper/gte-base",
        dimension: 768,
    },
];

/// 레지스트리 전체
pub fn list_embed_models() -> &'static [EmbeddingModelSpec] {
    EMBED_MODELS
}

/// 이름으로 레지스트리 조회
pub fn find_embed_model(name: &str) -> PipelineResult<EmbeddingModelSpec> {
    EMBED_MODELS
        .iter()
        .find(|m| m.name == name)
        .copied()
        .ok_or_else(|| PipelineError::UnknownEmbeddingModel(name.to_string()))
}

/// 이름으로 임베딩 모델 로드
///
/// 레지스트리에 없는 이름은 `UnknownEmbeddingModel`로 실패합니다.
pub fn load_embed_model(
    name: &str,
    config: &EmbeddingConfig,
) -> PipelineResult<Arc<dyn EmbeddingProvider>> {
    let spec = find_embed_model(name)?;
    let embedder = HuggingFaceEmbedding::new(spec, config)
        .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;

    tracing::info!(
        "Using embedding model {} ({}, dimension: {})",
        spec.name,
        spec.model_id,
        spec.dimension
    );
    Ok(Arc::new(embedder))
}

// ============================================================================
// Text Embeddings Inference
// ============================================================================

/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

/// 재시도 대기 시간 (`attempt`는 1부터, 상한 있음)
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(INITIAL_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// TEI 호환 서버 임베딩 구현체
///
/// ref: https://huggingface.github.io/text-embeddings-inference/
#[derive(Debug)]
pub struct HuggingFaceEmbedding {
    spec: EmbeddingModelSpec,
    endpoint: String,
    client: reqwest::Client,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
}

/// TEI 에러 응답
#[derive(Debug, Deserialize)]
struct TeiError {
    error: String,
    #[serde(default)]
    error_type: String,
}

impl HuggingFaceEmbedding {
    pub fn new(spec: EmbeddingModelSpec, config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            spec,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
            max_retries: config.max_retries,
        })
    }

    pub fn spec(&self) -> EmbeddingModelSpec {
        self.spec
    }

    /// `/embed` 호출 (전송 실패/429는 지수 백오프로 재시도)
    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.endpoint);
        let body = EmbedRequest {
            inputs,
            normalize: true,
        };

        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(attempt);
                tracing::warn!(
                    "Embedding request failed, retrying in {:?} (attempt {}/{})",
                    backoff,
                    attempt,
                    self.max_retries
                );
                tokio::time::sleep(backoff).await;
            }

            let response = match self.client.post(&url).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    continue;
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .context("Failed to read embedding response body")?;

            if status.is_success() {
                let vectors: Vec<Vec<f32>> =
                    serde_json::from_str(&text).context("Failed to parse embedding response")?;
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                last_error = Some(anyhow::anyhow!("Embedding server overloaded (429)"));
                continue;
            }

            if let Ok(error) = serde_json::from_str::<TeiError>(&text) {
                anyhow::bail!("Embedding server error ({}): {}", error.error_type, error.error);
            }
            anyhow::bail!("Embedding server error ({}): {}", status, text);
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("Embedding failed after {} retries", self.max_retries)
        }))
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.spec.dimension {
            anyhow::bail!(
                "Embedding dimension mismatch for {}: expected {}, got {}",
                self.spec.name,
                self.spec.dimension,
                vector.len()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for HuggingFaceEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.spec.dimension]);
        }

        let vectors = self.request(&[text.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding server returned no vectors"))?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let vectors = self.request(texts).await?;
        if vectors.len() != texts.len() {
            anyhow::bail!(
                "Embedding server returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            );
        }
        for vector in &vectors {
            self.check_dimension(vector)?;
        }

        tracing::debug!("Embedded batch of {} texts with {}", texts.len(), self.spec.name);
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.spec.dimension
    }

    fn name(&self) -> &str {
        self.spec.name
    }
}

// ============================================================================
// Tests
// ============================================================================
