//! 노트 세션과 컬렉션 잠금
//!
//! 세션은 "노트 불러오기 → 여러 번 질문 → 초기화" 흐름을 담당하고,
//! 컬렉션 잠금은 같은 이름의 컬렉션을 다루는 작업들을 직렬화합니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{PipelineError, PipelineResult};
use crate::knowledge::{build_documents_and_chunks, create_index, SentenceChunker};

use super::payload::{KeyedTexts, NoteExcerpts, QueryInput, QueryOutput};
use super::workflow::QueryWorkflow;

// ============================================================================
// CollectionLocks
// ============================================================================

/// 컬렉션 이름별 비동기 뮤텍스
#[derive(Debug, Default)]
pub struct CollectionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 컬렉션 잠금 획득 (guard가 drop될 때까지 유지)
    pub async fn acquire(&self, collection: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// ============================================================================
// NoteSession
// ============================================================================

/// 불러온 노트 상태
#[derive(Debug, Clone)]
pub struct LoadedNotes {
    pub excerpts: NoteExcerpts,
    pub patient_narrative: String,
    pub chunk_count: usize,
    pub loaded_at: DateTime<Utc>,
}

/// 세션 단위 노트 컬렉션
///
/// 노트를 다시 불러오면 이전 컬렉션은 통째로 교체됩니다.
pub struct NoteSession {
    workflow: QueryWorkflow,
    loaded: Option<LoadedNotes>,
}

impl NoteSession {
    pub fn new(workflow: QueryWorkflow) -> Self {
        Self {
            workflow,
            loaded: None,
        }
    }

    pub fn loaded(&self) -> Option<&LoadedNotes> {
        self.loaded.as_ref()
    }

    /// 노트 불러오기 (청킹 + 컬렉션 재생성)
    pub async fn load_notes(
        &mut self,
        excerpts: NoteExcerpts,
        patient_narrative: &str,
    ) -> PipelineResult<&LoadedNotes> {
        let services = self.workflow.services();
        let options = self.workflow.options();
        let chunker = SentenceChunker::new(options.chunk_config());
        let (documents, chunks) = build_documents_and_chunks(&excerpts, &chunker)?;

        {
            let _guard = self.workflow.locks().acquire(&options.collection).await;
            create_index(
                services.store.clone(),
                &documents,
                services.embedder.clone(),
                &options.collection,
            )
            .await?;
        }

        tracing::info!(
            "Loaded {} notes ({} chunks) into {}",
            documents.len(),
            chunks.len(),
            options.collection
        );

        Ok(&*self.loaded.insert(LoadedNotes {
            excerpts,
            patient_narrative: patient_narrative.trim().to_string(),
            chunk_count: chunks.len(),
            loaded_at: Utc::now(),
        }))
    }

    /// 불러온 노트에 대해 질문
    pub async fn ask(&self, patient_question: &str, clinical_question: &str) -> PipelineResult<QueryOutput> {
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| PipelineError::Input("no notes loaded".into()))?;

        if patient_question.trim().is_empty() && clinical_question.trim().is_empty() {
            return Err(PipelineError::Input("enter at least one question".into()));
        }

        let input = QueryInput::new(
            loaded.excerpts.clone(),
            [("0", patient_question.trim())].into_iter().collect::<KeyedTexts>(),
            clinical_question.trim(),
            loaded.patient_narrative.clone(),
        );
        Ok(self.workflow.process_query(input).await)
    }

    /// 컬렉션 삭제 후 상태 초기화
    pub async fn reset(&mut self) -> PipelineResult<()> {
        let services = self.workflow.services();
        let collection = &self.workflow.options().collection;

        let _guard = self.workflow.locks().acquire(collection).await;
        let exists = services
            .store
            .has_collection(collection)
            .await
            .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;
        if exists {
            services
                .store
                .delete_collection(collection)
                .await
                .map_err(|e| PipelineError::Index(PipelineError::chain(&e)))?;
        }

        self.loaded = None;
        tracing::info!("Session reset; collection {} removed", collection);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::knowledge::{MemoryVectorStore, VectorStore};
    use crate::llm::CompletionProvider;
    use crate::pipeline::{notes_from_lines, PipelineServices, WorkflowOptions};
    use crate::testing::{ace_answerer, test_workflow, ScriptedCompletion, VocabEmbedder};

    #[tokio::test]
    async fn test_locks_serialize_same_collection() {
        let locks = Arc::new(CollectionLocks::new());
        let guard = locks.acquire("note_excerpts").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("note_excerpts").await;
            })
        };

        // 다른 컬렉션은 막히지 않음
        tokio::time::timeout(Duration::from_secs(1), locks.acquire("other"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_ask_reset() {
        let workflow = test_workflow(
            Arc::new(ScriptedCompletion::constant("Yes")),
            Arc::new(ace_answerer()),
        );
        let store = workflow.services().store.clone();
        let mut session = NoteSession::new(workflow);

        let notes = notes_from_lines(
            "Patient has stage 2 hypertension.\nPrescribed Losartan.\n\nAlternative options include ACE inhibitors.",
        );
        let loaded = session.load_notes(notes, "  no other issues ").await.unwrap();
        assert_eq!(loaded.chunk_count, 3);
        assert_eq!(loaded.patient_narrative, "no other issues");
        assert!(store.has_collection("note_excerpts").await.unwrap());

        let output = session
            .ask("", "what are alternatives to amlodipine for hypertension")
            .await
            .unwrap();
        assert!(!output.error);
        assert!(output.response.contains("ACE inhibitors"));
        assert!(output.note_texts.contains("(3): Alternative options include ACE inhibitors."));

        session.reset().await.unwrap();
        assert!(session.loaded().is_none());
        assert!(!store.has_collection("note_excerpts").await.unwrap());
    }

    #[tokio::test]
    async fn test_ask_requires_notes_and_question() {
        let workflow = test_workflow(
            Arc::new(ScriptedCompletion::constant("Yes")),
            Arc::new(ace_answerer()),
        );
        let mut session = NoteSession::new(workflow);

        assert!(matches!(
            session.ask("q", "c").await,
            Err(PipelineError::Input(_))
        ));

        session
            .load_notes(notes_from_lines("Prescribed Losartan."), "n")
            .await
            .unwrap();
        assert!(matches!(
            session.ask("  ", "").await,
            Err(PipelineError::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_load_empty_notes_fails() {
        let workflow = test_workflow(
            Arc::new(ScriptedCompletion::constant("Yes")),
            Arc::new(ace_answerer()),
        );
        let mut session = NoteSession::new(workflow);

        let result = session.load_notes(notes_from_lines("\n \n"), "n").await;
        assert!(matches!(result, Err(PipelineError::Build(_))));
        assert!(session.loaded().is_none());
    }

    #[tokio::test]
    async fn test_reload_waits_for_running_query() {
        let store: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(VocabEmbedder::new());
        let locks = Arc::new(CollectionLocks::new());
        let services = |synthesis: Arc<dyn CompletionProvider>| PipelineServices {
            store: store.clone(),
            embedder: embedder.clone(),
            relevance: Arc::new(ScriptedCompletion::constant("Yes")),
            synthesis,
        };

        let slow = ace_answerer().with_delay(Duration::from_millis(300));
        let query_workflow = Arc::new(
            QueryWorkflow::new(services(Arc::new(slow)), WorkflowOptions::default())
                .with_locks(locks.clone()),
        );
        let mut session = NoteSession::new(
            QueryWorkflow::new(services(Arc::new(ace_answerer())), WorkflowOptions::default())
                .with_locks(locks.clone()),
        );

        let input = QueryInput::new(
            notes_from_lines(
                "Patient has stage 2 hypertension.\nAlternative options include ACE inhibitors.",
            ),
            [("0", "")].into_iter().collect::<KeyedTexts>(),
            "what are alternatives to amlodipine",
            "no other issues",
        );
        let query = {
            let workflow = query_workflow.clone();
            tokio::spawn(async move { workflow.process_query(input).await })
        };

        // 질의가 컬렉션을 만들고 합성 단계에 들어갈 때까지 대기
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.count("note_excerpts").await.unwrap() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let load = session.load_notes(notes_from_lines("Tinnitus noted."), "");
        tokio::pin!(load);

        // 질의가 끝나기 전에는 재적재가 진행되지 않음
        assert!(tokio::time::timeout(Duration::from_millis(100), &mut load)
            .await
            .is_err());
        assert!(!query.is_finished());
        assert_eq!(store.count("note_excerpts").await.unwrap(), 2);

        let output = query.await.unwrap();
        assert!(!output.error);
        assert!(output.relevant);

        let loaded = tokio::time::timeout(Duration::from_secs(1), load)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.chunk_count, 1);
        assert_eq!(store.count("note_excerpts").await.unwrap(), 1);
    }
}
