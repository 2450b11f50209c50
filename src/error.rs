//! 파이프라인 에러 분류
//!
//! 각 스테이지는 자신의 에러를 잡아 [`PipelineError`]로 변환하고
//! QueryState에 기록합니다. 워크플로우 경계를 넘어가는 에러는 없습니다.

use std::time::Duration;

use thiserror::Error;

/// 파이프라인 에러
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 입력 페이로드 누락/형식 오류
    #[error("invalid input: {0}")]
    Input(String),

    /// 관련성 판정 호출 실패 (soft reject로 처리)
    #[error("relevance check failed: {0}")]
    Relevance(String),

    /// 문서/청크 생성 실패
    #[error("failed to build documents: {0}")]
    Build(String),

    /// 임베딩 또는 컬렉션 생성 실패
    #[error("failed to build index: {0}")]
    Index(String),

    /// 알 수 없는 검색기 타입
    #[error("invalid retriever_type '{0}'. Choose from: 'base', 'auto_merger', 'bm25'")]
    InvalidRetrieverType(String),

    /// 답변 합성 실패
    #[error("answer synthesis failed: {0}")]
    Synthesis(String),

    /// 레지스트리에 없는 임베딩 모델
    #[error("embedding model '{0}' not found in the embedding model registry")]
    UnknownEmbeddingModel(String),

    /// 외부 호출 시간 초과
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },
}

impl PipelineError {
    /// 치명적 에러 여부
    ///
    /// 관련성 판정 실패와 판정 시간 초과만 "관련 없음"으로 처리되고,
    /// 나머지는 모두 `{error: true}`로 끝납니다.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Relevance(_) | PipelineError::Timeout { stage: "relevance", .. }
        )
    }

    /// anyhow 에러 체인을 한 줄 메시지로
    pub(crate) fn chain(err: &anyhow::Error) -> String {
        format!("{:#}", err)
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevance_error_is_soft() {
        assert!(!PipelineError::Relevance("boom".into()).is_fatal());
        assert!(PipelineError::Synthesis("boom".into()).is_fatal());
        assert!(PipelineError::InvalidRetrieverType("hybrid".into()).is_fatal());
    }

    #[test]
    fn test_only_relevance_timeout_is_soft() {
        let relevance = PipelineError::Timeout {
            stage: "relevance",
            elapsed: Duration::from_secs(1),
        };
        let synthesis = PipelineError::Timeout {
            stage: "synthesis",
            elapsed: Duration::from_secs(1),
        };
        assert!(!relevance.is_fatal());
        assert!(synthesis.is_fatal());
    }

    #[test]
    fn test_invalid_retriever_message() {
        let err = PipelineError::InvalidRetrieverType("hybrid".into());
        assert!(err.to_string().contains("'hybrid'"));
        assert!(err.to_string().contains("bm25"));
    }

    #[test]
    fn test_chain_includes_context() {
        let err = anyhow::anyhow!("connection refused").context("Failed to embed document");
        let msg = PipelineError::chain(&err);
        assert!(msg.contains("Failed to embed document"));
        assert!(msg.contains("connection refused"));
    }
}
