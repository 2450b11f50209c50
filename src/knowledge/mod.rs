//! Knowledge 모듈 - 노트 인덱싱과 검색
//!
//! - Chunker: 발췌 → Document/Chunk 변환 (문장 단위 분할)
//! - Vector: 벡터 저장소 트레이트 + LanceDB/인메모리 구현
//! - Index: 컬렉션 교체 방식의 노트 인덱스
//! - BM25: SQLite FTS5 어휘 검색
//! - Retriever: base / bm25 / auto_merger 검색기 팩토리

mod chunker;
mod vector;
mod lance;
mod memory;
mod index;
mod bm25;
mod retriever;

// Re-exports
pub use chunker::{
    build_documents_and_chunks, Chunk, ChunkConfig, Chunker, Document, SentenceChunker,
};
pub use vector::{cosine_similarity, sort_by_similarity, SearchResult, VectorEntry, VectorStore};
pub use lance::LanceVectorStore;
pub use memory::MemoryVectorStore;
pub use index::{create_index, initialize, NoteIndex};
pub use bm25::{Bm25Hit, Bm25Store};
pub use retriever::{
    build_retriever, default_top_k, AutoMergingRetriever, DenseRetriever, LexicalRetriever,
    Retriever, RetrieverType, ScoredChunk,
};
