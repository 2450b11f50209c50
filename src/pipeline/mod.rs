//! Pipeline 모듈 - 질의 처리 파이프라인
//!
//! 관련성 판정 → 문서 적재 → 검색기 생성 → 답변 합성 순서의 상태 기계와
//! 그 주변(입출력 페이로드, 노트 세션)을 담습니다.

mod payload;
mod relevance;
mod synthesizer;
mod workflow;
mod session;

// Re-exports
pub use payload::{
    notes_from_lines, AttributedAnswer, KeyedTexts, NoteExcerpts, QueryInput, QueryOutput,
    ValidatedInput,
};
pub use relevance::{Relevance, RelevanceGate};
pub use synthesizer::{answer_prompt, AnswerSynthesizer};
pub use workflow::{
    Outcome, PipelineServices, QueryState, QueryWorkflow, Stage, StageResult, WorkflowOptions,
};
pub use session::{CollectionLocks, LoadedNotes, NoteSession};
