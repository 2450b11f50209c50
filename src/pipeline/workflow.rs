//! Workflow Controller - 질의 처리 상태 기계
//!
//! `RelevanceCheck → DocumentLoad → Retrieve → Synthesize` 순서로 진행하며,
//! 각 스테이지는 [`StageResult`]로 다음 스테이지 또는 종료를 돌려줍니다.
//! 스테이지 에러는 모두 [`QueryState`]에 기록되고 경계를 넘어 전파되지 않습니다.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::{PipelineConfig, DEFAULT_COLLECTION};
use crate::embedding::{load_embed_model, EmbeddingProvider};
use crate::error::PipelineError;
use crate::knowledge::{
    build_documents_and_chunks, build_retriever, create_index, initialize, Chunk, ChunkConfig,
    Document, NoteIndex, Retriever, SentenceChunker, VectorStore,
};
use crate::llm::{create_completion, CompletionProvider};

use super::payload::{QueryInput, QueryOutput, ValidatedInput};
use super::relevance::{Relevance, RelevanceGate};
use super::session::CollectionLocks;
use super::synthesizer::AnswerSynthesizer;

// ============================================================================
// Services / Options
// ============================================================================

/// 워크플로우에 주입되는 외부 서비스 핸들
#[derive(Clone)]
pub struct PipelineServices {
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub relevance: Arc<dyn CompletionProvider>,
    pub synthesis: Arc<dyn CompletionProvider>,
}

/// 워크플로우 옵션
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub collection: String,
    pub retriever_type: String,
    /// None이면 청크 수로 계산
    pub top_k: Option<usize>,
    pub max_units: usize,
    pub relevance_timeout: Duration,
    /// 문서 하나당 임베딩 시간 한도
    pub embed_timeout: Duration,
    /// 검색/완성 호출 하나당 시간 한도
    pub synthesis_timeout: Duration,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl WorkflowOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            collection: if config.storage.collection.is_empty() {
                DEFAULT_COLLECTION.to_string()
            } else {
                config.storage.collection.clone()
            },
            retriever_type: config.retrieval.retriever_type.clone(),
            top_k: config.retrieval.top_k,
            max_units: config.chunking.max_units,
            relevance_timeout: Duration::from_secs(config.relevance.timeout_secs),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            synthesis_timeout: Duration::from_secs(config.synthesis.timeout_secs),
        }
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig::with_max_units(self.max_units)
    }
}

// ============================================================================
// State Machine Types
// ============================================================================

/// 워크플로우 스테이지
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RelevanceCheck,
    DocumentLoad,
    Retrieve,
    Synthesize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RelevanceCheck => "Question Relevance",
            Stage::DocumentLoad => "Document Loader",
            Stage::Retrieve => "Retriever",
            Stage::Synthesize => "Response Generator",
        };
        f.write_str(name)
    }
}

/// 종료 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 답변 생성 완료
    Answered,
    /// 관련 없음 (soft reject)
    NotRelevant,
    /// 치명적 실패
    Failed,
}

/// 스테이지 함수의 반환값
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    Continue(Stage),
    Terminate(Outcome),
}

/// 질의 1회분 상태
///
/// 호출마다 새로 만들어지고 결과를 돌려준 뒤 버려집니다.
#[derive(Debug)]
pub struct QueryState {
    pub query_id: Uuid,
    pub relevance: Option<Relevance>,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    pub index: Option<NoteIndex>,
    pub retriever_type: String,
    pub retriever: Option<Retriever>,
    pub response: String,
    pub note_texts: String,
    /// (source_key, chunk_text), 검색 순서
    pub supporting_notes: Vec<(String, String)>,
    pub error: Option<PipelineError>,
    /// 거쳐 간 스테이지
    pub stages: Vec<Stage>,
    pub outcome: Option<Outcome>,
}

impl QueryState {
    fn new(retriever_type: &str) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            relevance: None,
            documents: Vec::new(),
            chunks: Vec::new(),
            index: None,
            retriever_type: retriever_type.to_string(),
            retriever: None,
            response: String::new(),
            note_texts: String::new(),
            supporting_notes: Vec::new(),
            error: None,
            stages: Vec::new(),
            outcome: None,
        }
    }

    /// 실패 기록 후 종료
    fn fail(&mut self, stage: Stage, err: PipelineError) -> StageResult {
        tracing::error!("{} failed: {}", stage, err);
        self.error = Some(err);
        StageResult::Terminate(Outcome::Failed)
    }

    /// 호출자 출력으로 변환
    ///
    /// 치명적 실패는 부분 답변 없이 `error: true`만 돌려줍니다.
    pub fn to_output(&self) -> QueryOutput {
        let relevant = self.relevance == Some(Relevance::Yes);
        match self.outcome {
            Some(Outcome::Answered) => QueryOutput {
                error: false,
                relevant,
                response: self.response.clone(),
                note_texts: self.note_texts.clone(),
            },
            Some(Outcome::NotRelevant) => QueryOutput {
                error: false,
                relevant: false,
                ..Default::default()
            },
            Some(Outcome::Failed) | None => QueryOutput {
                error: true,
                relevant,
                ..Default::default()
            },
        }
    }
}

// ============================================================================
// QueryWorkflow
// ============================================================================

/// 질의 워크플로우
pub struct QueryWorkflow {
    services: PipelineServices,
    options: WorkflowOptions,
    locks: Arc<CollectionLocks>,
    gate: RelevanceGate,
    synthesizer: AnswerSynthesizer,
}

impl QueryWorkflow {
    pub fn new(services: PipelineServices, options: WorkflowOptions) -> Self {
        let gate = RelevanceGate::new(services.relevance.clone());
        let synthesizer =
            AnswerSynthesizer::new(services.synthesis.clone(), options.synthesis_timeout);
        Self {
            services,
            options,
            locks: Arc::new(CollectionLocks::new()),
            gate,
            synthesizer,
        }
    }

    /// 설정으로 서비스 생성 후 워크플로우 구성
    pub async fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let store = initialize(&config.storage.path).await?;
        let embedder = load_embed_model(&config.embedding.model, &config.embedding)?;
        let relevance = create_completion(&config.relevance)?;
        let synthesis = create_completion(&config.synthesis)?;

        Ok(Self::new(
            PipelineServices {
                store,
                embedder,
                relevance,
                synthesis,
            },
            WorkflowOptions::from_config(config),
        ))
    }

    /// 다른 워크플로우와 컬렉션 잠금 공유
    pub fn with_locks(mut self, locks: Arc<CollectionLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    pub fn locks(&self) -> &Arc<CollectionLocks> {
        &self.locks
    }

    /// 질의 처리 (호출자 페이로드 → 출력 페이로드)
    pub async fn process_query(&self, input: QueryInput) -> QueryOutput {
        let state = self.run(&input).await;
        let output = state.to_output();
        tracing::info!(
            query_id = %state.query_id,
            "Query finished: {:?} (error={}, relevant={})",
            state.outcome,
            output.error,
            output.relevant
        );
        output
    }

    /// 상태 기계 실행
    pub async fn run(&self, input: &QueryInput) -> QueryState {
        let mut state = QueryState::new(&self.options.retriever_type);
        let span = tracing::info_span!("query", id = %state.query_id);
        self.drive(&mut state, input).instrument(span).await;
        state
    }

    async fn drive(&self, state: &mut QueryState, input: &QueryInput) {
        let validated = match input.validate() {
            Ok(validated) => validated,
            Err(err) => {
                tracing::error!("Rejected payload: {}", err);
                state.error = Some(err);
                state.outcome = Some(Outcome::Failed);
                return;
            }
        };

        // DocumentLoad부터 호출 종료까지 컬렉션 잠금 유지
        let mut _collection_guard = None;
        let mut stage = Stage::RelevanceCheck;

        let outcome = loop {
            tracing::info!("STEP {}: {}", state.stages.len() + 1, stage);
            state.stages.push(stage);

            let result = match stage {
                Stage::RelevanceCheck => self.check_relevance(state, input).await,
                Stage::DocumentLoad => {
                    _collection_guard = Some(self.locks.acquire(&self.options.collection).await);
                    self.load_documents(state, &validated).await
                }
                Stage::Retrieve => self.prepare_retriever(state),
                Stage::Synthesize => self.generate_response(state, &validated).await,
            };

            match result {
                StageResult::Continue(next) => stage = next,
                StageResult::Terminate(outcome) => break outcome,
            }
        };

        state.outcome = Some(outcome);
    }

    /// RelevanceCheck: 실패나 시간 초과는 "관련 없음"
    async fn check_relevance(&self, state: &mut QueryState, input: &QueryInput) -> StageResult {
        let check = self.gate.check(
            input.patient_question.as_ref(),
            input.patient_narrative.as_deref(),
            input.note_excerpts.as_ref(),
        );

        let checked = match tokio::time::timeout(self.options.relevance_timeout, check).await {
            Ok(checked) => checked,
            Err(_) => Err(PipelineError::Timeout {
                stage: "relevance",
                elapsed: self.options.relevance_timeout,
            }),
        };

        let verdict = match checked {
            Ok(verdict) => verdict,
            Err(err) if !err.is_fatal() => {
                tracing::warn!("Treating query as not relevant: {}", err);
                state.error = Some(err);
                Relevance::No
            }
            Err(err) => return state.fail(Stage::RelevanceCheck, err),
        };

        state.relevance = Some(verdict);
        if verdict.is_relevant() {
            tracing::info!("The given inputs are relevant");
            StageResult::Continue(Stage::DocumentLoad)
        } else {
            tracing::info!("The given inputs are not relevant");
            StageResult::Terminate(Outcome::NotRelevant)
        }
    }

    /// DocumentLoad: 청킹 + 컬렉션 재생성
    async fn load_documents(&self, state: &mut QueryState, input: &ValidatedInput<'_>) -> StageResult {
        let chunker = SentenceChunker::new(self.options.chunk_config());
        let (documents, chunks) = match build_documents_and_chunks(input.note_excerpts, &chunker) {
            Ok(built) => built,
            Err(err) => return state.fail(Stage::DocumentLoad, err),
        };

        let count = u32::try_from(documents.len()).unwrap_or(u32::MAX).max(1);
        let budget = self.options.embed_timeout.saturating_mul(count);
        let indexing = create_index(
            self.services.store.clone(),
            &documents,
            self.services.embedder.clone(),
            &self.options.collection,
        );

        let index = match tokio::time::timeout(budget, indexing).await {
            Ok(Ok(index)) => index,
            Ok(Err(err)) => return state.fail(Stage::DocumentLoad, err),
            Err(_) => {
                return state.fail(
                    Stage::DocumentLoad,
                    PipelineError::Timeout {
                        stage: "document_load",
                        elapsed: budget,
                    },
                )
            }
        };

        tracing::info!(
            "Loaded {} docs, created {} chunks, indexed into {}",
            documents.len(),
            chunks.len(),
            index.collection()
        );

        state.documents = documents;
        state.chunks = chunks;
        state.index = Some(index);
        StageResult::Continue(Stage::Retrieve)
    }

    /// Retrieve: 검색기 생성
    fn prepare_retriever(&self, state: &mut QueryState) -> StageResult {
        let built = match state.index.as_ref() {
            Some(index) => build_retriever(
                index,
                &state.chunks,
                &state.retriever_type,
                self.options.top_k,
            ),
            None => Err(PipelineError::Index("no index was built".into())),
        };

        match built {
            Ok(retriever) => {
                tracing::info!(
                    "Created {} retriever (top_k={})",
                    retriever.retriever_type(),
                    retriever.top_k()
                );
                state.retriever = Some(retriever);
                StageResult::Continue(Stage::Synthesize)
            }
            Err(err) => state.fail(Stage::Retrieve, err),
        }
    }

    /// Synthesize: 성공/실패 모두 여기서 종료
    async fn generate_response(&self, state: &mut QueryState, input: &ValidatedInput<'_>) -> StageResult {
        let query = input.combined_query();
        let synthesized = match state.retriever.as_ref() {
            Some(retriever) => self.synthesizer.synthesize(retriever, &query).await,
            None => Err(PipelineError::Synthesis("no retriever was built".into())),
        };

        match synthesized {
            Ok(answer) => {
                tracing::info!("Response generated from notes {:?}", answer.source_keys());
                state.response = answer.answer_text.clone();
                state.note_texts = answer.note_texts();
                state.supporting_notes = answer.supporting_notes;
                StageResult::Terminate(Outcome::Answered)
            }
            Err(err) => state.fail(Stage::Synthesize, err),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::MemoryVectorStore;
    use crate::pipeline::{KeyedTexts, NoteExcerpts};
    use crate::testing::{
        ace_answerer, test_workflow, FailingCompletion, FailingEmbedder, ScriptedCompletion,
        VocabEmbedder,
    };

    fn scenario_notes() -> NoteExcerpts {
        [
            ("0", "Patient has stage 2 hypertension."),
            ("1", "Prescribed Losartan."),
            ("2", "Alternative options include ACE inhibitors."),
        ]
        .into_iter()
        .collect()
    }

    fn scenario_input(notes: NoteExcerpts, patient_question: &str, clinical_question: &str) -> QueryInput {
        QueryInput::new(
            notes,
            [("0", patient_question)].into_iter().collect::<KeyedTexts>(),
            clinical_question,
            "no other issues",
        )
    }

    /// 환자 질문에 amlodipine/hypertension 같은 임상 용어가 있을 때만 Yes
    fn clinical_judge() -> ScriptedCompletion {
        ScriptedCompletion::new(|prompt| {
            let question = prompt
                .split("## Patient Question")
                .nth(1)
                .and_then(|rest| rest.split("## Clinical Notes").next())
                .unwrap_or_default()
                .to_lowercase();
            if question.contains("amlodipine") || question.contains("blood pressure") {
                "Yes".to_string()
            } else {
                "No".to_string()
            }
        })
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));
        let input = scenario_input(
            scenario_notes(),
            "What other medicine can I take?",
            "what are alternatives to amlodipine for hypertension",
        );

        let state = workflow.run(&input).await;
        assert_eq!(state.relevance, Some(Relevance::Yes));
        assert_eq!(state.outcome, Some(Outcome::Answered));
        assert_eq!(
            state.stages,
            vec![Stage::RelevanceCheck, Stage::DocumentLoad, Stage::Retrieve, Stage::Synthesize]
        );
        assert_eq!(state.documents.len(), 3);
        assert_eq!(state.chunks.len(), 3);
        assert!(state.supporting_notes.iter().any(|(k, _)| k == "2"));
        // top_k = max(1, 3 * 2 / 3)
        assert_eq!(state.supporting_notes.len(), 2);

        let output = state.to_output();
        assert!(!output.error);
        assert!(output.relevant);
        assert!(output.response.contains("ACE inhibitors"));
        assert!(output
            .note_texts
            .contains("(2): Alternative options include ACE inhibitors."));
    }

    #[tokio::test]
    async fn test_unrelated_question_short_circuits() {
        let synthesis = Arc::new(ace_answerer());
        let store = Arc::new(MemoryVectorStore::new());
        let workflow = QueryWorkflow::new(
            PipelineServices {
                store: store.clone(),
                embedder: Arc::new(VocabEmbedder::new()),
                relevance: Arc::new(clinical_judge()),
                synthesis: synthesis.clone(),
            },
            WorkflowOptions::default(),
        );

        let state = workflow
            .run(&scenario_input(scenario_notes(), "what's the weather", ""))
            .await;

        assert_eq!(state.relevance, Some(Relevance::No));
        assert_eq!(state.outcome, Some(Outcome::NotRelevant));
        assert_eq!(state.stages, vec![Stage::RelevanceCheck]);
        assert!(state.error.is_none());

        let output = state.to_output();
        assert_eq!(
            output,
            QueryOutput {
                error: false,
                relevant: false,
                response: String::new(),
                note_texts: String::new(),
            }
        );
        // 인덱스/합성 단계는 실행되지 않음
        assert!(store.list_collections().await.unwrap().is_empty());
        assert!(synthesis.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_related_question_passes_gate() {
        let workflow = test_workflow(Arc::new(clinical_judge()), Arc::new(ace_answerer()));
        let output = workflow
            .process_query(QueryInput::new(
                scenario_notes(),
                [("0", "alternatives to amlodipine?")].into_iter().collect(),
                "",
                "patient reports leg swelling on amlodipine",
            ))
            .await;

        assert!(output.relevant);
        assert!(!output.error);
    }

    #[tokio::test]
    async fn test_relevance_failure_is_soft_reject() {
        let workflow = test_workflow(Arc::new(FailingCompletion), Arc::new(ace_answerer()));
        let state = workflow
            .run(&scenario_input(scenario_notes(), "q", "alternatives to amlodipine"))
            .await;

        assert_eq!(state.outcome, Some(Outcome::NotRelevant));
        assert!(matches!(state.error, Some(PipelineError::Relevance(_))));
        let output = state.to_output();
        assert!(!output.error);
        assert!(!output.relevant);
    }

    #[tokio::test]
    async fn test_relevance_timeout_is_soft_reject() {
        let slow = ScriptedCompletion::constant("Yes").with_delay(Duration::from_millis(500));
        let mut workflow = test_workflow(Arc::new(slow), Arc::new(ace_answerer()));
        workflow.options.relevance_timeout = Duration::from_millis(20);

        let state = workflow
            .run(&scenario_input(scenario_notes(), "q", "alternatives to amlodipine"))
            .await;

        assert_eq!(state.outcome, Some(Outcome::NotRelevant));
        assert!(matches!(
            state.error,
            Some(PipelineError::Timeout { stage: "relevance", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_field_is_input_error() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));
        let input = QueryInput::from_json(r#"{"note_excerpts": {"0": "Prescribed Losartan."}}"#).unwrap();

        let state = workflow.run(&input).await;
        assert!(state.stages.is_empty());
        assert!(matches!(state.error, Some(PipelineError::Input(_))));

        let output = state.to_output();
        assert!(output.error);
        assert!(output.response.is_empty());
    }

    #[tokio::test]
    async fn test_empty_notes_is_build_error() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));
        let state = workflow
            .run(&scenario_input(NoteExcerpts::new(), "q", "c"))
            .await;

        assert_eq!(state.stages, vec![Stage::RelevanceCheck, Stage::DocumentLoad]);
        assert!(matches!(state.error, Some(PipelineError::Build(_))));
        assert!(state.to_output().error);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_index_error() {
        let workflow = QueryWorkflow::new(
            PipelineServices {
                store: Arc::new(MemoryVectorStore::new()),
                embedder: Arc::new(FailingEmbedder),
                relevance: Arc::new(ScriptedCompletion::constant("Yes")),
                synthesis: Arc::new(ace_answerer()),
            },
            WorkflowOptions::default(),
        );

        let state = workflow
            .run(&scenario_input(scenario_notes(), "q", "c"))
            .await;

        assert!(matches!(state.error, Some(PipelineError::Index(_))));
        assert_eq!(state.outcome, Some(Outcome::Failed));
        assert!(state.to_output().error);
    }

    #[tokio::test]
    async fn test_invalid_retriever_type_is_fatal() {
        let mut workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));
        workflow.options.retriever_type = "hybrid".to_string();

        let state = workflow
            .run(&scenario_input(scenario_notes(), "q", "c"))
            .await;

        assert_eq!(state.stages.last(), Some(&Stage::Retrieve));
        assert!(matches!(
            state.error,
            Some(PipelineError::InvalidRetrieverType(ref t)) if t == "hybrid"
        ));
        let output = state.to_output();
        assert!(output.error);
        assert!(output.relevant);
        assert!(output.response.is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_withholds_answer() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(FailingCompletion));
        let state = workflow
            .run(&scenario_input(scenario_notes(), "q", "alternatives to amlodipine"))
            .await;

        assert_eq!(state.stages.last(), Some(&Stage::Synthesize));
        assert!(matches!(state.error, Some(PipelineError::Synthesis(_))));
        let output = state.to_output();
        assert!(output.error);
        assert!(output.note_texts.is_empty());
    }

    #[tokio::test]
    async fn test_reload_replaces_previous_notes() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));

        let old_notes: NoteExcerpts = [("old0", "Amlodipine caused leg swelling.")].into_iter().collect();
        let output = workflow
            .process_query(scenario_input(old_notes, "leg swelling", "amlodipine"))
            .await;
        assert!(output.note_texts.contains("(old0)"));

        let new_notes: NoteExcerpts = [
            ("new0", "Tinnitus noted in both ears."),
            ("new1", "Mild hand tremor when anxious."),
        ]
        .into_iter()
        .collect();
        let state = workflow
            .run(&scenario_input(new_notes, "leg swelling", "amlodipine"))
            .await;

        assert_eq!(state.outcome, Some(Outcome::Answered));
        assert!(!state.supporting_notes.is_empty());
        assert!(state.supporting_notes.iter().all(|(k, _)| k.starts_with("new")));
        assert_eq!(
            workflow.services().store.count("note_excerpts").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_bm25_workflow() {
        let mut workflow = test_workflow(Arc::new(ScriptedCompletion::constant("Yes")), Arc::new(ace_answerer()));
        workflow.options.retriever_type = "bm25".to_string();
        workflow.options.top_k = Some(1);

        let state = workflow
            .run(&scenario_input(scenario_notes(), "", "alternatives to amlodipine"))
            .await;

        assert_eq!(state.outcome, Some(Outcome::Answered));
        assert_eq!(
            state.supporting_notes,
            vec![("2".to_string(), "Alternative options include ACE inhibitors.".to_string())]
        );
    }

    #[tokio::test]
    async fn test_query_ids_are_unique() {
        let workflow = test_workflow(Arc::new(ScriptedCompletion::constant("No")), Arc::new(ace_answerer()));
        let input = scenario_input(scenario_notes(), "q", "c");
        let a = workflow.run(&input).await;
        let b = workflow.run(&input).await;
        assert_ne!(a.query_id, b.query_id);
    }
}
