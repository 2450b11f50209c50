//! Retriever Factory
//!
//! 같은 청크 집합 위에서 교체 가능한 세 가지 검색 전략을 만듭니다.
//!
//! - `base`: 벡터 인덱스 최근접 검색
//! - `bm25`: FTS5 어간 기반 어휘 검색 (인덱스 사용 안 함)
//! - `auto_merger`: `base` 결과에서 형제 청크가 과반이면 부모 발췌로 병합
//!
//! 모든 전략은 "질의 → (청크, 스코어) 목록(스코어 내림차순, 동점은 청크 순서)"
//! 계약을 공유합니다.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::{PipelineError, PipelineResult};

use super::bm25::Bm25Store;
use super::chunker::Chunk;
use super::index::NoteIndex;

// ============================================================================
// Types
// ============================================================================

/// 검색된 청크
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// 검색기 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrieverType {
    Base,
    Bm25,
    AutoMerger,
}

impl RetrieverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverType::Base => "base",
            RetrieverType::Bm25 => "bm25",
            RetrieverType::AutoMerger => "auto_merger",
        }
    }
}

impl FromStr for RetrieverType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base" => Ok(RetrieverType::Base),
            "bm25" => Ok(RetrieverType::Bm25),
            "auto_merger" => Ok(RetrieverType::AutoMerger),
            other => Err(PipelineError::InvalidRetrieverType(other.to_string())),
        }
    }
}

impl fmt::Display for RetrieverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 기본 top_k: `max(1, floor(chunk_count * 2 / 3))`
pub fn default_top_k(chunk_count: usize) -> usize {
    (chunk_count * 2 / 3).max(1)
}

// ============================================================================
// Retriever
// ============================================================================

/// 검색 전략 (닫힌 변형 집합)
#[derive(Debug, Clone)]
pub enum Retriever {
    Base(DenseRetriever),
    Bm25(LexicalRetriever),
    AutoMerger(AutoMergingRetriever),
}

impl Retriever {
    /// 질의로 청크 검색
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        match self {
            Retriever::Base(r) => r.retrieve(query).await,
            Retriever::Bm25(r) => r.retrieve(query),
            Retriever::AutoMerger(r) => r.retrieve(query).await,
        }
    }

    pub fn retriever_type(&self) -> RetrieverType {
        match self {
            Retriever::Base(_) => RetrieverType::Base,
            Retriever::Bm25(_) => RetrieverType::Bm25,
            Retriever::AutoMerger(_) => RetrieverType::AutoMerger,
        }
    }

    pub fn top_k(&self) -> usize {
        match self {
            Retriever::Base(r) => r.top_k,
            Retriever::Bm25(r) => r.top_k,
            Retriever::AutoMerger(r) => r.dense.top_k,
        }
    }
}

/// 검색기 생성
///
/// 알 수 없는 타입은 `InvalidRetrieverType`으로 실패합니다 (재시도 없음).
pub fn build_retriever(
    index: &NoteIndex,
    chunks: &[Chunk],
    retriever_type: &str,
    top_k: Option<usize>,
) -> PipelineResult<Retriever> {
    let kind: RetrieverType = retriever_type.parse()?;
    let top_k = top_k.unwrap_or_else(|| default_top_k(chunks.len())).max(1);

    let retriever = match kind {
        RetrieverType::Base => Retriever::Base(DenseRetriever::new(index.clone(), chunks, top_k)),
        RetrieverType::Bm25 => Retriever::Bm25(
            LexicalRetriever::new(chunks, top_k)
                .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?,
        ),
        RetrieverType::AutoMerger => Retriever::AutoMerger(AutoMergingRetriever::new(
            DenseRetriever::new(index.clone(), chunks, top_k),
        )),
    };

    tracing::debug!("Built {} retriever (top_k={})", kind, top_k);
    Ok(retriever)
}

// ============================================================================
// Dense
// ============================================================================

/// 벡터 최근접 검색기
///
/// 인덱스는 문서 단위이므로, 문서 히트를 해당 발췌의 청크들로 펼칩니다.
#[derive(Debug, Clone)]
pub struct DenseRetriever {
    index: NoteIndex,
    chunks: Vec<Chunk>,
    /// source_key -> 청크 위치 목록 (청크 순서)
    by_source: HashMap<String, Vec<usize>>,
    top_k: usize,
}

impl DenseRetriever {
    fn new(index: NoteIndex, chunks: &[Chunk], top_k: usize) -> Self {
        let mut by_source: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, chunk) in chunks.iter().enumerate() {
            by_source.entry(chunk.source_key.clone()).or_default().push(i);
        }

        Self {
            index,
            chunks: chunks.to_vec(),
            by_source,
            top_k,
        }
    }

    /// 문서 히트를 청크 위치로 펼침
    async fn search(&self, query: &str) -> Result<DenseHits> {
        let hits = self.index.search(query, self.top_k).await?;

        let mut positions: Vec<(usize, f32)> = hits
            .iter()
            .filter_map(|hit| self.by_source.get(&hit.source_key).map(|p| (p, hit.similarity)))
            .flat_map(|(p, score)| p.iter().map(move |&i| (i, score)))
            .collect();

        sort_best_first(&mut positions);
        positions.truncate(self.top_k);

        let excerpts = hits
            .into_iter()
            .map(|hit| (hit.source_key, hit.text))
            .collect();
        Ok(DenseHits {
            positions,
            excerpts,
        })
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let hits = self.search(query).await?;
        Ok(hits
            .positions
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }
}

/// 벡터 검색 결과
struct DenseHits {
    /// (청크 위치, 스코어), 최고 스코어 순
    positions: Vec<(usize, f32)>,
    /// source_key -> 인덱스에 저장된 발췌 원문
    excerpts: HashMap<String, String>,
}

// ============================================================================
// Lexical
// ============================================================================

/// BM25 어휘 검색기
#[derive(Debug, Clone)]
pub struct LexicalRetriever {
    store: Bm25Store,
    chunks: Vec<Chunk>,
    top_k: usize,
}

impl LexicalRetriever {
    fn new(chunks: &[Chunk], top_k: usize) -> Result<Self> {
        Ok(Self {
            store: Bm25Store::build(chunks)?,
            chunks: chunks.to_vec(),
            top_k,
        })
    }

    fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let hits = self.store.search(query, self.top_k)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                self.chunks.get(hit.position).map(|chunk| ScoredChunk {
                    chunk: chunk.clone(),
                    score: hit.score,
                })
            })
            .collect())
    }
}

// ============================================================================
// Auto-merging
// ============================================================================

/// 형제 청크 병합 검색기
///
/// 한 발췌의 청크 중 과반이 검색되면 부모 발췌 하나로 합칩니다.
#[derive(Debug, Clone)]
pub struct AutoMergingRetriever {
    dense: DenseRetriever,
}

impl AutoMergingRetriever {
    fn new(dense: DenseRetriever) -> Self {
        Self { dense }
    }

    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let hits = self.dense.search(query).await?;
        Ok(self.merge(&hits))
    }

    fn merge(&self, hits: &DenseHits) -> Vec<ScoredChunk> {
        let positions = &hits.positions;
        // source_key -> (검색된 형제 수, 최고 스코어)
        let mut retrieved: HashMap<&str, (usize, f32)> = HashMap::new();
        for &(i, score) in positions.iter() {
            let entry = retrieved
                .entry(self.dense.chunks[i].source_key.as_str())
                .or_insert((0, f32::MIN));
            entry.0 += 1;
            entry.1 = entry.1.max(score);
        }

        let mut merged_emitted: Vec<&str> = Vec::new();
        let mut results = Vec::with_capacity(positions.len());

        for &(i, score) in positions.iter() {
            let chunk = &self.dense.chunks[i];
            let key = chunk.source_key.as_str();
            let siblings = self.dense.by_source.get(key).map(Vec::len).unwrap_or(1);
            let (hit_count, best) = retrieved[key];

            if siblings > 1 && hit_count * 2 > siblings {
                if merged_emitted.contains(&key) {
                    continue;
                }
                merged_emitted.push(key);
                tracing::debug!(
                    "Merging {}/{} chunks of excerpt {} into parent",
                    hit_count,
                    siblings,
                    key
                );
                results.push(ScoredChunk {
                    chunk: self.parent_of(key, hits),
                    score: best,
                });
            } else {
                results.push(ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                });
            }
        }

        results
    }

    /// 부모 발췌 (인덱스에 저장된 원문 그대로)
    ///
    /// 원문이 없으면 형제 청크를 순서대로 이어 붙입니다.
    fn parent_of(&self, key: &str, hits: &DenseHits) -> Chunk {
        let text = match hits.excerpts.get(key) {
            Some(text) => text.clone(),
            None => self
                .dense
                .by_source
                .get(key)
                .map(|positions| {
                    positions
                        .iter()
                        .map(|&i| self.dense.chunks[i].text.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default(),
        };

        Chunk {
            source_key: key.to_string(),
            text,
        }
    }
}

/// 스코어 내림차순, 동점은 청크 위치 오름차순
fn sort_best_first(positions: &mut [(usize, f32)]) {
    positions.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
}

// ============================================================================
// Tests
// ============================================================================
