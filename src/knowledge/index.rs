//! Vector Index Store
//!
//! 모든 문서를 임베딩해서 이름 있는 컬렉션 하나에 저장합니다.
//! 같은 이름의 컬렉션은 항상 통째로 교체됩니다 (병합/버전 없음).

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::config::MEMORY_STORAGE;
use crate::embedding::EmbeddingProvider;
use crate::error::{PipelineError, PipelineResult};

use super::chunker::Document;
use super::lance::LanceVectorStore;
use super::memory::MemoryVectorStore;
use super::vector::{SearchResult, VectorEntry, VectorStore};

/// 저장소 열기 (없으면 생성, 멱등)
///
/// `:memory:` 경로는 인메모리 저장소를 엽니다.
pub async fn initialize(storage_path: &Path) -> PipelineResult<Arc<dyn VectorStore>> {
    if storage_path.as_os_str() == MEMORY_STORAGE {
        return Ok(Arc::new(MemoryVectorStore::new()));
    }

    let store = LanceVectorStore::open(storage_path)
        .await
        .with_context(|| format!("Failed to open vector storage at {}", storage_path.display()))
        .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;
    Ok(Arc::new(store))
}

// ============================================================================
// NoteIndex
// ============================================================================

/// 컬렉션 하나에 바인딩된 검색 가능한 인덱스
#[derive(Clone)]
pub struct NoteIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    document_count: usize,
}

impl std::fmt::Debug for NoteIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteIndex")
            .field("collection", &self.collection)
            .field("embedder", &self.embedder.name())
            .field("document_count", &self.document_count)
            .finish()
    }
}

impl NoteIndex {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn document_count(&self) -> usize {
        self.document_count
    }

    /// 질의를 임베딩해 유사 문서 검색
    pub async fn search(&self, query: &str, limit: usize) -> anyhow::Result<Vec<SearchResult>> {
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .context("Failed to embed query")?;
        self.store
            .query(&self.collection, &query_embedding, limit)
            .await
    }
}

/// 인덱스 생성 (기존 컬렉션은 삭제 후 재생성)
///
/// 삭제 실패는 경고만 남기고 계속 진행합니다.
/// 임베딩은 청크가 아닌 Document 단위로 한 번씩 계산됩니다.
pub async fn create_index(
    store: Arc<dyn VectorStore>,
    documents: &[Document],
    embedder: Arc<dyn EmbeddingProvider>,
    collection_name: &str,
) -> PipelineResult<NoteIndex> {
    // 1. 기존 컬렉션 삭제
    match store.list_collections().await {
        Ok(names) if names.iter().any(|n| n == collection_name) => {
            if let Err(e) = store.delete_collection(collection_name).await {
                tracing::warn!("Could not delete collection {}: {:#}", collection_name, e);
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!("Could not delete collection {}: {:#}", collection_name, e);
        }
    }

    // 2. 새 컬렉션
    store
        .get_or_create_collection(collection_name, embedder.dimension())
        .await
        .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;

    // 3. 문서 임베딩
    let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
    let embeddings = embedder
        .embed_batch(&texts)
        .await
        .context("Failed to embed documents")
        .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;

    if embeddings.len() != documents.len() {
        return Err(PipelineError::Index(format!(
            "embedder returned {} vectors for {} documents",
            embeddings.len(),
            documents.len()
        )));
    }

    let entries: Vec<VectorEntry> = documents
        .iter()
        .zip(embeddings)
        .enumerate()
        .map(|(i, (doc, embedding))| VectorEntry {
            entry_id: doc.key.clone(),
            source_key: doc.key.clone(),
            text: doc.text.clone(),
            ordinal: i as u64,
            embedding,
        })
        .collect();

    // 4. 저장
    store
        .upsert(collection_name, &entries)
        .await
        .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;

    tracing::info!(
        "Indexed {} documents into collection {} with {}",
        entries.len(),
        collection_name,
        embedder.name()
    );

    Ok(NoteIndex {
        store,
        embedder,
        collection: collection_name.to_string(),
        document_count: entries.len(),
    })
}

// ============================================================================
// Tests
// ============================================================================
