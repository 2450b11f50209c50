//! LanceDB Vector Store - 영속 벡터 저장소
//!
//! 컬렉션 하나가 LanceDB 테이블 하나에 대응합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt64Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::table::Table;
use lancedb::DistanceType;

use super::vector::{sort_by_similarity, SearchResult, VectorEntry, VectorStore};

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
///
/// Apache Arrow 기반 columnar 저장소로, 경로 단위로 열고 테이블을 컬렉션으로 씁니다.
pub struct LanceVectorStore {
    db: Connection,
}

impl LanceVectorStore {
    /// LanceDB 저장소 열기 (없으면 생성, 멱등)
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            tokio::fs::create_dir_all(path)
                .await
                .context("Failed to create LanceDB directory")?;
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        tracing::debug!("LanceDB opened at {:?}", path);
        Ok(Self { db })
    }

    /// 컬렉션 테이블 스키마
    fn create_schema(dimension: i32) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("entry_id", DataType::Utf8, false),
            Field::new("source_key", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("ordinal", DataType::UInt64, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ]))
    }

    /// 엔트리들을 Arrow RecordBatch로 변환
    fn entries_to_batch(entries: &[VectorEntry], dimension: i32) -> Result<RecordBatch> {
        if entries.is_empty() {
            anyhow::bail!("Cannot create batch from empty entries");
        }

        if let Some(bad) = entries
            .iter()
            .find(|e| e.embedding.len() != dimension as usize)
        {
            anyhow::bail!(
                "Embedding dimension {} does not match collection dimension {} (entry {})",
                bad.embedding.len(),
                dimension,
                bad.entry_id
            );
        }

        let entry_ids: Vec<&str> = entries.iter().map(|e| e.entry_id.as_str()).collect();
        let source_keys: Vec<&str> = entries.iter().map(|e| e.source_key.as_str()).collect();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        let ordinals: Vec<u64> = entries.iter().map(|e| e.ordinal).collect();

        let embeddings_flat: Vec<f32> = entries
            .iter()
            .flat_map(|e| e.embedding.iter().copied())
            .collect();

        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            dimension,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create embedding array")?;

        RecordBatch::try_new(
            Self::create_schema(dimension),
            vec![
                Arc::new(StringArray::from(entry_ids)),
                Arc::new(StringArray::from(source_keys)),
                Arc::new(StringArray::from(texts)),
                Arc::new(UInt64Array::from(ordinals)),
                Arc::new(embeddings_list),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    async fn open_collection(&self, name: &str) -> Result<Table> {
        self.db
            .open_table(name)
            .execute()
            .await
            .with_context(|| format!("Failed to open collection {}", name))
    }

    /// 테이블 스키마에서 임베딩 차원 조회
    async fn collection_dimension(table: &Table) -> Result<i32> {
        let schema = table.schema().await.context("Failed to read table schema")?;
        let field = schema
            .field_with_name("embedding")
            .context("Missing embedding column")?;
        match field.data_type() {
            DataType::FixedSizeList(_, dim) => Ok(*dim),
            other => anyhow::bail!("Unexpected embedding column type: {:?}", other),
        }
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        self.db
            .table_names()
            .execute()
            .await
            .context("Failed to list collections")
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.db
            .drop_table(name)
            .await
            .with_context(|| format!("Failed to delete collection {}", name))
    }

    async fn get_or_create_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let dimension = i32::try_from(dimension).context("Embedding dimension too large")?;

        if self.has_collection(name).await? {
            let table = self.open_collection(name).await?;
            let existing = Self::collection_dimension(&table).await?;
            if existing != dimension {
                anyhow::bail!(
                    "Collection {} has dimension {}, requested {}",
                    name,
                    existing,
                    dimension
                );
            }
            return Ok(());
        }

        self.db
            .create_empty_table(name, Self::create_schema(dimension))
            .execute()
            .await
            .with_context(|| format!("Failed to create collection {}", name))?;

        tracing::debug!("Created collection {} (dimension {})", name, dimension);
        Ok(())
    }

    async fn upsert(&self, collection: &str, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let table = self.open_collection(collection).await?;
        let dimension = Self::collection_dimension(&table).await?;
        let batch = Self::entries_to_batch(entries, dimension)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        let mut merge = table.merge_insert(&["entry_id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(batches))
            .await
            .context("Failed to upsert vectors")?;

        Ok(entries.len())
    }

    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        if !self.has_collection(collection).await? {
            return Ok(vec![]);
        }

        let table = self.open_collection(collection).await?;

        // 동점 경계에서 LanceDB 순서에 의존하지 않도록 전체를 받아 직접 자름
        let total = table.count_rows(None).await.context("Failed to count rows")?;
        if total == 0 || limit == 0 {
            return Ok(vec![]);
        }

        let stream = table
            .vector_search(query_embedding.to_vec())
            .context("Failed to create vector search")?
            .distance_type(DistanceType::Cosine)
            .limit(total)
            .execute()
            .await
            .context("Failed to execute vector search")?;

        let batches: Vec<RecordBatch> = stream.try_collect().await?;
        let mut results = Vec::new();

        for batch in batches {
            let entry_ids = string_column(&batch, "entry_id")?;
            let source_keys = string_column(&batch, "source_key")?;
            let texts = string_column(&batch, "text")?;
            let ordinals = batch
                .column_by_name("ordinal")
                .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing ordinal column"))?;

            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                results.push(SearchResult {
                    entry_id: entry_ids.value(i).to_string(),
                    source_key: source_keys.value(i).to_string(),
                    text: texts.value(i).to_string(),
                    ordinal: ordinals.value(i),
                    // 코사인 거리 -> 유사도
                    similarity: 1.0 - distances.value(i),
                });
            }
        }

        sort_by_similarity(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        if !self.has_collection(collection).await? {
            return Ok(0);
        }

        let table = self.open_collection(collection).await?;
        table
            .count_rows(None)
            .await
            .context("Failed to count rows")
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
}

// ============================================================================
// Tests
// ============================================================================
