//! Answer Synthesizer - 반복 정제(refine) 답변 합성
//!
//! 검색된 청크마다 완성 서비스를 한 번씩 호출합니다. 첫 호출은 답을 새로 만들고,
//! 이후 호출은 직전 답과 새 청크를 받아 답을 수정합니다.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::knowledge::{Retriever, ScoredChunk};
use crate::llm::CompletionProvider;

use super::payload::AttributedAnswer;

/// 답변 합성기
pub struct AnswerSynthesizer {
    completion: Arc<dyn CompletionProvider>,
    call_timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(completion: Arc<dyn CompletionProvider>, call_timeout: Duration) -> Self {
        Self {
            completion,
            call_timeout,
        }
    }

    /// 검색 후 답변 합성
    ///
    /// `supporting_notes`는 이번 질의에서 실제로 검색된 청크만, 검색 순서대로 담습니다.
    pub async fn synthesize(
        &self,
        retriever: &Retriever,
        query: &str,
    ) -> PipelineResult<AttributedAnswer> {
        let retrieved = tokio::time::timeout(self.call_timeout, retriever.retrieve(query))
            .await
            .map_err(|_| PipelineError::Timeout {
                stage: "retrieval",
                elapsed: self.call_timeout,
            })?
            .map_err(|e| PipelineError::Synthesis(PipelineError::chain(&e)))?;

        tracing::info!(
            "Retrieved {} chunks with {} retriever: {:?}",
            retrieved.len(),
            retriever.retriever_type(),
            retrieved
                .iter()
                .map(|r| r.chunk.source_key.as_str())
                .collect::<Vec<_>>()
        );

        let answer_text = self.refine(&retrieved, query).await?;

        Ok(AttributedAnswer {
            answer_text,
            supporting_notes: retrieved
                .into_iter()
                .map(|r| (r.chunk.source_key, r.chunk.text))
                .collect(),
        })
    }

    /// 청크 순서대로 답변 정제
    async fn refine(&self, retrieved: &[ScoredChunk], query: &str) -> PipelineResult<String> {
        let mut answer: Option<String> = None;

        for (step, scored) in retrieved.iter().enumerate() {
            let context = match &answer {
                None => scored.chunk.text.clone(),
                Some(existing) => refine_context(existing, &scored.chunk.text),
            };
            let prompt = answer_prompt(&context, query);

            let response = tokio::time::timeout(self.call_timeout, self.completion.complete(&prompt))
                .await
                .map_err(|_| PipelineError::Timeout {
                    stage: "synthesis",
                    elapsed: self.call_timeout,
                })?
                .map_err(|e| PipelineError::Synthesis(PipelineError::chain(&e)))?;

            tracing::debug!(
                "Refine step {}/{} on ({})",
                step + 1,
                retrieved.len(),
                scored.chunk.source_key
            );
            answer = Some(response.trim().to_string());
        }

        if answer.is_none() {
            tracing::warn!("No chunks retrieved; answer left empty");
        }
        Ok(answer.unwrap_or_default())
    }
}

/// 답변 템플릿 (첫 호출과 정제 호출 공통)
pub fn answer_prompt(context: &str, query: &str) -> String {
    format!(
        "You are a clinical assistant that answers questions using only the context given below.\n\
         ---------------------\n\
         {context}\n\
         ---------------------\n\
         Using this context and no prior knowledge, give a short, direct answer.\n\
         Leave out extra detail and long explanations; state only what the question needs.\n\
         Consider only the parts of the context that bear on the question and ignore the rest.\n\
         Answer from the context alone, never from outside knowledge.\n\
         Keep the answer to two or three sentences at most.\n\
         Query: {query}\n\
         Answer: "
    )
}

/// 정제 호출용 컨텍스트 (새 청크 + 기존 답 + 수정 지시)
fn refine_context(existing_answer: &str, chunk_text: &str) -> String {
    format!(
        "{chunk_text}\n\n\
         Existing answer: {existing_answer}\n\
         Revise the existing answer using the context above rather than starting over. \
         If the context adds nothing relevant, return the existing answer unchanged."
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        build_documents_and_chunks, build_retriever, create_index, MemoryVectorStore,
        SentenceChunker, VectorStore,
    };
    use crate::pipeline::NoteExcerpts;
    use crate::testing::{FailingCompletion, ScriptedCompletion, VocabEmbedder};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn retriever_over(pairs: &[(&str, &str)], kind: &str, top_k: Option<usize>) -> Retriever {
        let notes: NoteExcerpts = pairs.iter().copied().collect();
        let (docs, chunks) =
            build_documents_and_chunks(&notes, &SentenceChunker::with_defaults()).unwrap();
        let store: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let index = create_index(store, &docs, Arc::new(VocabEmbedder::new()), "note_excerpts")
            .await
            .unwrap();
        build_retriever(&index, &chunks, kind, top_k).unwrap()
    }

    #[test]
    fn test_answer_prompt_shape() {
        let prompt = answer_prompt("Prescribed Losartan.", "What was prescribed?");
        assert!(prompt.contains("---------------------\nPrescribed Losartan.\n---------------------"));
        assert!(prompt.contains("two or three sentences"));
        assert!(prompt.ends_with("Query: What was prescribed?\nAnswer: "));
    }

    #[tokio::test]
    async fn test_refines_once_per_chunk() {
        let retriever = retriever_over(
            &[
                ("0", "Amlodipine caused leg swelling."),
                ("1", "Alternative options include ACE inhibitors."),
                ("2", "Tinnitus noted."),
            ],
            "bm25",
            Some(3),
        )
        .await;

        let completion = Arc::new(ScriptedCompletion::new(|prompt| {
            if prompt.contains("Existing answer:") {
                "Consider ACE inhibitors instead of amlodipine.".to_string()
            } else {
                "Amlodipine caused swelling.".to_string()
            }
        }));
        let synthesizer = AnswerSynthesizer::new(completion.clone(), TIMEOUT);

        let answer = synthesizer
            .synthesize(&retriever, "alternatives to amlodipine")
            .await
            .unwrap();

        // bm25: "alternatives"와 "amlodipine"이 맞는 청크 2개
        assert_eq!(answer.source_keys(), vec!["0", "1"]);
        assert_eq!(answer.answer_text, "Consider ACE inhibitors instead of amlodipine.");

        let prompts = completion.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Existing answer:"));
        assert!(prompts[1].contains("Existing answer: Amlodipine caused swelling."));
        assert!(prompts[1].contains("Alternative options include ACE inhibitors."));
        assert!(prompts[1].contains("rather than starting over"));
    }

    #[tokio::test]
    async fn test_no_chunks_means_no_calls() {
        let retriever = retriever_over(&[("0", "Tinnitus noted.")], "bm25", None).await;
        let completion = Arc::new(ScriptedCompletion::constant("unused"));
        let synthesizer = AnswerSynthesizer::new(completion.clone(), TIMEOUT);

        let answer = synthesizer.synthesize(&retriever, "amlodipine").await.unwrap();

        assert!(answer.answer_text.is_empty());
        assert!(answer.supporting_notes.is_empty());
        assert!(completion.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_completion_failure() {
        let retriever = retriever_over(&[("0", "Prescribed Losartan.")], "base", None).await;
        let synthesizer = AnswerSynthesizer::new(Arc::new(FailingCompletion), TIMEOUT);

        let result = synthesizer.synthesize(&retriever, "Losartan").await;
        assert!(matches!(result, Err(PipelineError::Synthesis(_))));
    }

    #[tokio::test]
    async fn test_completion_timeout() {
        let retriever = retriever_over(&[("0", "Prescribed Losartan.")], "base", None).await;
        let completion = ScriptedCompletion::constant("late").with_delay(Duration::from_millis(500));
        let synthesizer = AnswerSynthesizer::new(Arc::new(completion), Duration::from_millis(20));

        let result = synthesizer.synthesize(&retriever, "Losartan").await;
        assert!(matches!(
            result,
            Err(PipelineError::Timeout { stage: "synthesis", .. })
        ));
    }
}
