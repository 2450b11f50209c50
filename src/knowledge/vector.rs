//! Vector Store - 컬렉션 단위 벡터 저장소 트레이트 및 유틸리티
//!
//! 컬렉션 이름으로 격리된 임베딩 저장소입니다.
//! create-or-open, list, delete, get-or-create, upsert, 유사도 검색을 지원합니다.

use anyhow::Result;
use async_trait::async_trait;

// ============================================================================
// Types
// ============================================================================

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// 엔트리 ID (upsert 키)
    pub entry_id: String,
    /// 원본 발췌 키
    pub source_key: String,
    pub text: String,
    /// 입력 순서 (동점 정렬 기준)
    pub ordinal: u64,
    pub embedding: Vec<f32>,
}

/// 검색 결과
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entry_id: String,
    pub source_key: String,
    pub text: String,
    pub ordinal: u64,
    /// 유사도 스코어 (높을수록 유사)
    pub similarity: f32,
}

/// 유사도 내림차순, 동점은 입력 순서
pub fn sort_by_similarity(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ordinal.cmp(&b.ordinal))
    });
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 컬렉션 이름 목록
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// 컬렉션 삭제 (없으면 에러)
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// 컬렉션 열기 또는 생성
    async fn get_or_create_collection(&self, name: &str, dimension: usize) -> Result<()>;

    /// 엔트리 upsert (entry_id 기준)
    async fn upsert(&self, collection: &str, entries: &[VectorEntry]) -> Result<usize>;

    /// 유사도 검색 (유사도 내림차순)
    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchResult>>;

    /// 엔트리 개수
    async fn count(&self, collection: &str) -> Result<usize>;

    /// 컬렉션 존재 여부
    async fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.list_collections().await?.iter().any(|n| n == name))
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
