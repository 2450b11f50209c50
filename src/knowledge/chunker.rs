//! Document / Chunk Builder
//!
//! 노트 발췌(key → text)를 키가 붙은 Document와 크기 제한 Chunk로 변환합니다.
//! 청크는 발췌 경계를 넘지 않으며 오버랩이 없습니다.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::llm::CHARS_PER_TOKEN;
use crate::pipeline::NoteExcerpts;

/// 문장 경계 (종결 부호 + 공백)
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+[\s]+").expect("sentence boundary pattern"));

// ============================================================================
// Types
// ============================================================================

/// 발췌 하나에 대응하는 문서
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// 호출자가 부여한 발췌 키
    pub key: String,
    pub text: String,
}

/// 검색 단위 청크 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 원본 발췌 키
    pub source_key: String,
    pub text: String,
}

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (토큰 근사치, 오버랩 없음)
    pub max_units: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self { max_units: 2048 }
    }
}

impl ChunkConfig {
    pub fn with_max_units(max_units: usize) -> Self {
        Self {
            max_units: max_units.max(1),
        }
    }

    fn max_chars(&self) -> usize {
        self.max_units * CHARS_PER_TOKEN
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// SentenceChunker
// ============================================================================

/// 문장 단위 청커
///
/// 문장을 최대 크기까지 채워 넣고, 한 문장이 최대 크기를 넘을 때만
/// 공백 경계에서 강제로 자릅니다.
pub struct SentenceChunker {
    config: ChunkConfig,
}

impl SentenceChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// 문장으로 분할 (종결 부호는 앞 문장에 남김)
    fn split_sentences(text: &str) -> Vec<&str> {
        let mut sentences = Vec::new();
        let mut start = 0;

        for m in SENTENCE_END.find_iter(text) {
            let sentence = text[start..m.end()].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = m.end();
        }

        let rest = text[start..].trim();
        if !rest.is_empty() {
            sentences.push(rest);
        }

        sentences
    }

    /// 최대 크기를 넘는 문장을 강제 분할
    fn hard_split(&self, sentence: &str) -> Vec<String> {
        let max_chars = self.config.max_chars();
        let mut pieces = Vec::new();
        let mut remaining = sentence;

        while !remaining.is_empty() {
            if remaining.len() <= max_chars {
                pieces.push(remaining.trim().to_string());
                break;
            }

            let split_at = floor_char_boundary(remaining, max_chars);
            // 공백 경계 우선
            let actual = remaining[..split_at]
                .rfind(char::is_whitespace)
                .filter(|&pos| pos > 0)
                .unwrap_or(split_at);
            let actual = if actual == 0 {
                // 첫 문자가 max_chars보다 긴 경우 (max_chars < 문자 폭)
                remaining
                    .char_indices()
                    .nth(1)
                    .map(|(i, _)| i)
                    .unwrap_or(remaining.len())
            } else {
                actual
            };

            let piece = remaining[..actual].trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
            remaining = remaining[actual..].trim_start();
        }

        pieces
    }
}

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.is_empty() {
            return vec![];
        }

        let max_chars = self.config.max_chars();
        if text.len() <= max_chars {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for sentence in Self::split_sentences(text) {
            if !current.is_empty() && current.len() + 1 + sentence.len() > max_chars {
                chunks.push(std::mem::take(&mut current));
            }

            if sentence.len() > max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                chunks.extend(self.hard_split(sentence));
                continue;
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
        }

        if !current.is_empty() {
            chunks.push(current);
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    fn name(&self) -> &'static str {
        "SentenceChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

// ============================================================================
// Builder
// ============================================================================

/// 발췌 매핑에서 Document와 Chunk 생성
///
/// 입력 순서를 유지하며, 각 발췌는 독립적으로 청킹됩니다.
pub fn build_documents_and_chunks(
    excerpts: &NoteExcerpts,
    chunker: &dyn Chunker,
) -> PipelineResult<(Vec<Document>, Vec<Chunk>)> {
    if excerpts.is_empty() {
        return Err(PipelineError::Build("note excerpt mapping is empty".into()));
    }

    let mut documents = Vec::with_capacity(excerpts.len());
    let mut chunks = Vec::with_capacity(excerpts.len());

    for (key, text) in excerpts.iter() {
        if key.trim().is_empty() {
            return Err(PipelineError::Build("note excerpt with empty key".into()));
        }
        if text.trim().is_empty() {
            return Err(PipelineError::Build(format!("note excerpt '{}' is empty", key)));
        }

        documents.push(Document {
            key: key.clone(),
            text: text.clone(),
        });

        for piece in chunker.chunk(text) {
            chunks.push(Chunk {
                source_key: key.clone(),
                text: piece,
            });
        }
    }

    tracing::debug!(
        "Built {} documents and {} chunks with {}",
        documents.len(),
        chunks.len(),
        chunker.name()
    );

    Ok((documents, chunks))
}

// ============================================================================
// Tests
// ============================================================================
