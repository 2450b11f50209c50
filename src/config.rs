//! 설정 모듈
//!
//! TOML 파일(선택) → 기본값 → 환경변수 오버라이드 순으로 설정을 구성합니다.
//!
//! 환경변수:
//! - `OPENROUTER_API_KEY`: 관련성 판정 모델 API 키
//! - `OLLAMA_HOST`: 로컬 Ollama 서버 주소 (답변 합성 모델)
//! - `EMBEDDING_ENDPOINT`: 임베딩 서버 주소
//! - `CLINICAL_RAG_DATA_DIR`: 저장소 루트

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// 기본 컬렉션 이름
pub const DEFAULT_COLLECTION: &str = "note_excerpts";

/// 인메모리 저장소 경로 표기
pub const MEMORY_STORAGE: &str = ":memory:";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로
///
/// `CLINICAL_RAG_DATA_DIR`가 있으면 우선 사용합니다.
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CLINICAL_RAG_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clinical-notes-rag")
}

// ============================================================================
// Config Types
// ============================================================================

/// 전체 파이프라인 설정
///
/// `relevance`/`synthesis` 섹션은 [`CompletionSection`]으로 따로 읽어
/// 선택한 프로바이더의 기본값 위에 덮어씁니다.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    #[serde(skip_deserializing)]
    pub relevance: CompletionConfig,
    #[serde(skip_deserializing)]
    pub synthesis: CompletionConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            relevance: CompletionConfig::openrouter(),
            synthesis: CompletionConfig::ollama(),
            retrieval: RetrievalConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

/// 벡터 저장소 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// LanceDB 경로 (`:memory:`이면 인메모리 저장소)
    pub path: PathBuf,
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: get_data_dir().join("notes.lance"),
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

impl StorageConfig {
    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_STORAGE
    }
}

/// 임베딩 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// 레지스트리 모델 이름 (예: `BAAI_bge`)
    pub model: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "BAAI_bge".to_string(),
            endpoint: "http://127.0.0.1:8080".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// 텍스트 완성 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    OpenRouter,
}

/// 텍스트 완성 서비스 설정
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub endpoint: String,
    /// API 키 (없으면 환경변수에서)
    pub api_key: Option<String>,
    /// 컨텍스트 윈도우 (토큰 근사치)
    pub context_window: usize,
    /// 호출당 최대 대기 시간
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self::ollama()
    }
}

impl CompletionConfig {
    /// 프로바이더별 기본값
    pub fn preset(provider: ProviderKind) -> Self {
        match provider {
            ProviderKind::Ollama => Self::ollama(),
            ProviderKind::OpenRouter => Self::openrouter(),
        }
    }

    /// 답변 합성 기본값 (로컬 Ollama)
    pub fn ollama() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            model: "ahmgam/medllama3-v20".to_string(),
            endpoint: "http://127.0.0.1:11434".to_string(),
            api_key: None,
            context_window: 4096,
            timeout_secs: 120,
        }
    }

    /// 관련성 판정 기본값 (OpenRouter)
    pub fn openrouter() -> Self {
        Self {
            provider: ProviderKind::OpenRouter,
            model: "deepseek/deepseek-r1:free".to_string(),
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            context_window: 4096,
            timeout_secs: 120,
        }
    }
}

/// TOML의 완성 서비스 섹션 (지정한 필드만)
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CompletionSection {
    provider: Option<ProviderKind>,
    model: Option<String>,
    endpoint: Option<String>,
    api_key: Option<String>,
    context_window: Option<usize>,
    timeout_secs: Option<u64>,
}

impl CompletionSection {
    /// 프로바이더 기본값 위에 지정한 필드를 덮어쓰기
    fn resolve(self, fallback: ProviderKind) -> CompletionConfig {
        let base = CompletionConfig::preset(self.provider.unwrap_or(fallback));
        CompletionConfig {
            provider: base.provider,
            model: self.model.unwrap_or(base.model),
            endpoint: self.endpoint.unwrap_or(base.endpoint),
            api_key: self.api_key.or(base.api_key),
            context_window: self.context_window.unwrap_or(base.context_window),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
        }
    }
}

/// 검색 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// `base` | `bm25` | `auto_merger`
    pub retriever_type: String,
    /// 지정하지 않으면 청크 수 기반 휴리스틱
    pub top_k: Option<usize>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            retriever_type: "base".to_string(),
            top_k: None,
        }
    }
}

/// 청킹 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// 청크 최대 크기 (토큰 근사치)
    pub max_units: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_units: 2048 }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl PipelineConfig {
    /// 기본값 + 환경변수
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// TOML 파일 로드 후 환경변수 적용
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// 파일이 주어지면 로드, 아니면 기본값
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::from_env()),
        }
    }

    /// TOML 문자열 파싱
    ///
    /// 완성 섹션에서 빠진 필드는 그 섹션 프로바이더의 기본값으로 채웁니다.
    /// 프로바이더를 지정하지 않으면 relevance는 OpenRouter, synthesis는 Ollama.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(content).context("Invalid TOML")?;
        let mut config: Self = raw.clone().try_into().context("Invalid config schema")?;
        config.relevance = completion_section(&raw, "relevance")?.resolve(ProviderKind::OpenRouter);
        config.synthesis = completion_section(&raw, "synthesis")?.resolve(ProviderKind::Ollama);
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(key) = non_empty_env("OPENROUTER_API_KEY") {
            for completion in [&mut self.relevance, &mut self.synthesis] {
                if completion.provider == ProviderKind::OpenRouter && completion.api_key.is_none()
                {
                    completion.api_key = Some(key.clone());
                }
            }
        }

        if let Some(host) = non_empty_env("OLLAMA_HOST") {
            for completion in [&mut self.relevance, &mut self.synthesis] {
                if completion.provider == ProviderKind::Ollama {
                    completion.endpoint = host.trim_end_matches('/').to_string();
                }
            }
        }

        if let Some(endpoint) = non_empty_env("EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = endpoint.trim_end_matches('/').to_string();
        }
    }
}

fn completion_section(raw: &toml::Value, name: &str) -> Result<CompletionSection> {
    match raw.get(name) {
        Some(section) => section
            .clone()
            .try_into()
            .with_context(|| format!("Invalid [{}] section", name)),
        None => Ok(CompletionSection::default()),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
