//! 인메모리 벡터 저장소
//!
//! 세션이 끝나면 사라지는 저장소입니다. LanceDB와 같은 계약을 따릅니다.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::vector::{cosine_similarity, sort_by_similarity, SearchResult, VectorEntry, VectorStore};

#[derive(Debug, Default)]
struct Collection {
    dimension: usize,
    /// 삽입 순서 유지
    entries: Vec<VectorEntry>,
}

/// 인메모리 VectorStore 구현
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        match self.collections.write().await.remove(name) {
            Some(_) => Ok(()),
            None => anyhow::bail!("Collection {} does not exist", name),
        }
    }

    async fn get_or_create_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| Collection {
                dimension,
                entries: Vec::new(),
            });

        if collection.dimension != dimension {
            anyhow::bail!(
                "Collection {} has dimension {}, requested {}",
                name,
                collection.dimension,
                dimension
            );
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, entries: &[VectorEntry]) -> Result<usize> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| anyhow::anyhow!("Collection {} does not exist", collection))?;

        for entry in entries {
            if entry.embedding.len() != target.dimension {
                anyhow::bail!(
                    "Embedding dimension {} does not match collection dimension {}",
                    entry.embedding.len(),
                    target.dimension
                );
            }

            match target
                .entries
                .iter_mut()
                .find(|e| e.entry_id == entry.entry_id)
            {
                Some(existing) => *existing = entry.clone(),
                None => target.entries.push(entry.clone()),
            }
        }

        Ok(entries.len())
    }

    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Ok(vec![]);
        };

        let mut results: Vec<SearchResult> = target
            .entries
            .iter()
            .map(|e| SearchResult {
                entry_id: e.entry_id.clone(),
                source_key: e.source_key.clone(),
                text: e.text.clone(),
                ordinal: e.ordinal,
                similarity: cosine_similarity(query_embedding, &e.embedding),
            })
            .collect();

        sort_by_similarity(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.entries.len())
            .unwrap_or(0))
    }
}
