//! 테스트용 가짜 서비스
//!
//! 네트워크 없이 결정적으로 동작하는 임베딩/완성 프로바이더입니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::knowledge::MemoryVectorStore;
use crate::llm::CompletionProvider;
use crate::pipeline::{PipelineServices, QueryWorkflow, WorkflowOptions};

const VOCAB_DIMENSION: usize = 512;

/// 어휘 인덱스 기반 bag-of-words 임베더
///
/// 처음 보는 토큰마다 새 차원을 배정하므로 해시 충돌이 없습니다.
/// 토큰은 소문자화, 영숫자 외 제거, 끝의 복수형 `s` 제거를 거칩니다.
#[derive(Debug, Default)]
pub(crate) struct VocabEmbedder {
    vocab: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl VocabEmbedder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 지금까지 임베딩한 텍스트 수
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn normalize(token: &str) -> String {
        let token: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        match token.strip_suffix('s') {
            Some(stem) if token.len() > 3 => stem.to_string(),
            _ => token,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for VocabEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut vector = vec![0.0; VOCAB_DIMENSION];
        let mut vocab = self.vocab.lock().unwrap();
        for token in text.split_whitespace().map(Self::normalize) {
            if token.is_empty() {
                continue;
            }
            let next = vocab.len();
            let slot = *vocab.entry(token).or_insert(next) % VOCAB_DIMENSION;
            vector[slot] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        VOCAB_DIMENSION
    }

    fn name(&self) -> &str {
        "vocab-test"
    }
}

/// 항상 실패하는 임베더
#[derive(Debug, Default)]
pub(crate) struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding service unavailable")
    }

    fn dimension(&self) -> usize {
        VOCAB_DIMENSION
    }

    fn name(&self) -> &str {
        "failing-test"
    }
}

type Script = Box<dyn Fn(&str) -> String + Send + Sync>;

/// 프롬프트를 받아 정해진 답을 돌려주는 완성 프로바이더
///
/// 받은 프롬프트를 모두 기록합니다.
pub(crate) struct ScriptedCompletion {
    script: Script,
    prompts: Mutex<Vec<String>>,
    context_window: usize,
    delay: Option<Duration>,
}

impl ScriptedCompletion {
    pub(crate) fn new(script: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
            context_window: 4096,
            delay: None,
        }
    }

    /// 항상 같은 답
    pub(crate) fn constant(answer: &str) -> Self {
        let answer = answer.to_string();
        Self::new(move |_| answer.clone())
    }

    pub(crate) fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    /// 응답 전에 대기 (타임아웃 테스트용)
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok((self.script)(prompt))
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn name(&self) -> &str {
        "scripted-test"
    }
}

/// 항상 실패하는 완성 프로바이더
#[derive(Debug, Default)]
pub(crate) struct FailingCompletion;

#[async_trait]
impl CompletionProvider for FailingCompletion {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        anyhow::bail!("completion service unavailable")
    }

    fn context_window(&self) -> usize {
        4096
    }

    fn name(&self) -> &str {
        "failing-test"
    }
}

/// 컨텍스트에 ACE inhibitors가 보이면 그것을 답으로 내는 합성 모델
pub(crate) fn ace_answerer() -> ScriptedCompletion {
    ScriptedCompletion::new(|prompt| {
        if prompt.contains("ACE inhibitors") {
            "ACE inhibitors are an alternative to amlodipine for this patient.".to_string()
        } else {
            "The notes do not describe alternative treatments.".to_string()
        }
    })
}

/// 인메모리 저장소 + 어휘 임베더로 구성한 워크플로우
pub(crate) fn test_workflow(
    relevance: Arc<dyn CompletionProvider>,
    synthesis: Arc<dyn CompletionProvider>,
) -> QueryWorkflow {
    QueryWorkflow::new(
        PipelineServices {
            store: Arc::new(MemoryVectorStore::new()),
            embedder: Arc::new(VocabEmbedder::new()),
            relevance,
            synthesis,
        },
        WorkflowOptions::default(),
    )
}
