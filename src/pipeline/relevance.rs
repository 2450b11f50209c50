//! Relevance Gate - 질문/노트 관련성 판정
//!
//! 텍스트 완성 서비스에 Yes/No 분류를 한 번 요청합니다.
//! 정확히 `"Yes"`가 아닌 모든 응답은 `No`로 정규화되고,
//! 입력 누락이나 서비스 실패 시에는 항상 "관련 없음" 쪽으로 닫힙니다.

use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::llm::{approx_tokens, truncate_to_tokens, CompletionProvider};

use super::payload::{KeyedTexts, NoteExcerpts};

/// 모델 응답용으로 남겨두는 토큰 수
const ANSWER_RESERVE_TOKENS: usize = 16;

const NOTES_PLACEHOLDER: &str = "{notes}";

/// 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Yes,
    No,
}

impl Relevance {
    /// 모델 응답 정규화 (trim 후 정확히 "Yes"만 Yes)
    pub fn from_response(response: &str) -> Self {
        if response.trim() == "Yes" {
            Relevance::Yes
        } else {
            Relevance::No
        }
    }

    pub fn is_relevant(self) -> bool {
        self == Relevance::Yes
    }
}

impl fmt::Display for Relevance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relevance::Yes => write!(f, "Yes"),
            Relevance::No => write!(f, "No"),
        }
    }
}

/// 관련성 게이트
pub struct RelevanceGate {
    completion: Arc<dyn CompletionProvider>,
}

impl RelevanceGate {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self { completion }
    }

    /// 관련성 판정
    ///
    /// 입력 누락이나 서비스 실패는 [`PipelineError::Relevance`]로 돌려주며,
    /// 호출자는 이를 `No`로 취급해야 합니다.
    pub async fn check(
        &self,
        patient_question: Option<&KeyedTexts>,
        patient_narrative: Option<&str>,
        note_excerpts: Option<&NoteExcerpts>,
    ) -> PipelineResult<Relevance> {
        let questions = patient_question
            .ok_or_else(|| PipelineError::Relevance("patient_question is missing".into()))?;
        let narrative = patient_narrative
            .ok_or_else(|| PipelineError::Relevance("patient_narrative is missing".into()))?;
        let notes = note_excerpts
            .ok_or_else(|| PipelineError::Relevance("note_excerpts is missing".into()))?;

        let prompt = self.build_prompt(
            &questions.join_values("\n"),
            narrative,
            &notes.join_values("\n"),
        );

        let response = self
            .completion
            .complete(&prompt)
            .await
            .map_err(|e| PipelineError::Relevance(PipelineError::chain(&e)))?;

        let verdict = Relevance::from_response(&response);
        tracing::debug!("Relevance model answered {:?} -> {}", response.trim(), verdict);
        Ok(verdict)
    }

    /// 판정 프롬프트 구성
    ///
    /// 노트 부분은 컨텍스트 윈도우에 맞도록 뒤를 잘라냅니다.
    fn build_prompt(&self, questions: &str, narrative: &str, notes: &str) -> String {
        let skeleton = relevance_prompt(questions, narrative, NOTES_PLACEHOLDER);
        let budget = self
            .completion
            .context_window()
            .saturating_sub(approx_tokens(&skeleton) + ANSWER_RESERVE_TOKENS);

        let fitted = truncate_to_tokens(notes, budget);
        if fitted.len() < notes.len() {
            tracing::warn!(
                "Clinical notes truncated to ~{} tokens for relevance check",
                budget
            );
        }
        relevance_prompt(questions, narrative, fitted)
    }
}

fn relevance_prompt(questions: &str, narrative: &str, notes: &str) -> String {
    format!(
        r#"You are an expert clinical assistant.

# Task
Decide whether the patient's question relates to the clinical notes. Read the notes to understand the patient's clinical history, and use the patient narrative as additional context.

# Questions that count as related
  - A follow-up on something in the notes.
  - Consequences or complications of a documented problem.
  - Questions about treatment or medication.
  - Diagnostic clarification or concerns about symptoms of a documented problem.
  - Anything the clinical notes address directly.

# Inputs
## Patient Narrative
{narrative}

## Patient Question
{questions}

## Clinical Notes
{notes}

# Output Format (follow strictly)
- Yes -- the question is related to the notes
- No -- the question is not related to the notes

# Instructions
Apply clinical reasoning: could the notes help answer, or give insight into, the patient's question?
Reply with exactly "Yes" or "No" and nothing else. No explanation.
"#
    )
}

// ============================================================================
// Tests
// ============================================================================
