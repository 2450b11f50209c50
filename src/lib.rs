//! clinical-notes-rag - 임상 노트 질의응답 파이프라인
//!
//! 관련성 판정 → 노트 청킹/인덱싱 → 검색 → 반복 정제 답변 합성으로 이어지는
//! 검색 증강 생성(RAG) 파이프라인입니다. 벡터 검색은 LanceDB,
//! 어휘 검색은 SQLite FTS5(BM25)를 사용합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod pipeline;

#[cfg(test)]
mod testing;

// Re-exports
pub use config::{get_data_dir, PipelineConfig};
pub use embedding::{list_embed_models, load_embed_model, EmbeddingProvider, HuggingFaceEmbedding};
pub use error::{PipelineError, PipelineResult};
pub use knowledge::{
    build_documents_and_chunks, build_retriever, create_index, initialize, Chunk, Document,
    LanceVectorStore, MemoryVectorStore, NoteIndex, Retriever, RetrieverType, VectorStore,
};
pub use llm::{create_completion, CompletionProvider};
pub use pipeline::{
    notes_from_lines, NoteExcerpts, NoteSession, QueryInput, QueryOutput, QueryWorkflow,
};
