//! 입출력 페이로드
//!
//! 호출자(UI 계층)와 주고받는 JSON 형태의 입력/출력입니다.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PipelineError, PipelineResult};

// ============================================================================
// KeyedTexts
// ============================================================================

/// 키 → 텍스트 매핑 (입력 순서 유지, 키는 유일)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyedTexts {
    entries: Vec<(String, String)>,
}

/// 노트 발췌 매핑
pub type NoteExcerpts = KeyedTexts;

impl KeyedTexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// 삽입 (같은 키가 있으면 위치를 유지한 채 교체)
    pub fn insert(&mut self, key: impl Into<String>, text: impl Into<String>) {
        let key = key.into();
        let text = text.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = text,
            None => self.entries.push((key, text)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, v)| v.as_str())
    }

    /// 값을 구분자로 연결
    pub fn join_values(&self, separator: &str) -> String {
        self.values().collect::<Vec<_>>().join(separator)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyedTexts {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut texts = KeyedTexts::new();
        for (k, v) in iter {
            texts.insert(k, v);
        }
        texts
    }
}

impl Serialize for KeyedTexts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KeyedTexts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyedTextsVisitor;

        impl<'de> Visitor<'de> for KeyedTextsVisitor {
            type Value = KeyedTexts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping from string keys to text")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut texts = KeyedTexts::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    texts.insert(key, value);
                }
                Ok(texts)
            }
        }

        deserializer.deserialize_map(KeyedTextsVisitor)
    }
}

/// "한 줄에 발췌 하나" 텍스트를 발췌 매핑으로 변환
///
/// 빈 줄은 버리고, 키는 남은 줄의 원래 줄 번호입니다.
pub fn notes_from_lines(text: &str) -> NoteExcerpts {
    text.trim()
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.trim();
            (!line.is_empty()).then(|| (i.to_string(), line.to_string()))
        })
        .collect()
}

// ============================================================================
// Input / Output
// ============================================================================

/// 호출자 입력 페이로드
///
/// 모든 필드는 선택적으로 역직렬화되고 [`QueryInput::validate`]에서 검사됩니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(default)]
    pub note_excerpts: Option<NoteExcerpts>,
    #[serde(default)]
    pub patient_question: Option<KeyedTexts>,
    #[serde(default)]
    pub clinical_question: Option<String>,
    #[serde(default)]
    pub patient_narrative: Option<String>,
}

/// 검증된 입력
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInput<'a> {
    pub note_excerpts: &'a NoteExcerpts,
    pub patient_question: &'a KeyedTexts,
    pub clinical_question: &'a str,
    pub patient_narrative: &'a str,
}

impl QueryInput {
    pub fn new(
        note_excerpts: NoteExcerpts,
        patient_question: KeyedTexts,
        clinical_question: impl Into<String>,
        patient_narrative: impl Into<String>,
    ) -> Self {
        Self {
            note_excerpts: Some(note_excerpts),
            patient_question: Some(patient_question),
            clinical_question: Some(clinical_question.into()),
            patient_narrative: Some(patient_narrative.into()),
        }
    }

    /// JSON 문자열에서 파싱
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::Input(e.to_string()))
    }

    /// 필수 필드 확인
    pub fn validate(&self) -> PipelineResult<ValidatedInput<'_>> {
        let note_excerpts = self
            .note_excerpts
            .as_ref()
            .ok_or_else(|| PipelineError::Input("note_excerpts is missing".into()))?;
        let patient_question = self
            .patient_question
            .as_ref()
            .ok_or_else(|| PipelineError::Input("patient_question is missing".into()))?;
        let clinical_question = self
            .clinical_question
            .as_deref()
            .ok_or_else(|| PipelineError::Input("clinical_question is missing".into()))?;
        let patient_narrative = self
            .patient_narrative
            .as_deref()
            .ok_or_else(|| PipelineError::Input("patient_narrative is missing".into()))?;

        Ok(ValidatedInput {
            note_excerpts,
            patient_question,
            clinical_question,
            patient_narrative,
        })
    }
}

impl ValidatedInput<'_> {
    /// 검색/합성용 결합 질의 (환자 질문들 + 임상 질문)
    pub fn combined_query(&self) -> String {
        format!(
            "{} {}",
            self.patient_question.join_values(" "),
            self.clinical_question
        )
        .trim()
        .to_string()
    }
}

/// 호출자 출력 페이로드
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub error: bool,
    /// 관련성 판정 결과 (false + error=false 이면 soft reject)
    pub relevant: bool,
    pub response: String,
    /// `"(key): chunk_text"` 줄 목록
    pub note_texts: String,
}

/// 근거가 붙은 답변
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedAnswer {
    pub answer_text: String,
    /// (source_key, chunk_text), 검색 순서
    pub supporting_notes: Vec<(String, String)>,
}

impl AttributedAnswer {
    /// `"(key): text"` 줄바꿈 목록
    pub fn note_texts(&self) -> String {
        self.supporting_notes
            .iter()
            .map(|(key, text)| format!("({}): {}", key, text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn source_keys(&self) -> Vec<&str> {
        self.supporting_notes.iter().map(|(k, _)| k.as_str()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
