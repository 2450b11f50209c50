//! BM25 Store - rusqlite FTS5 기반 어휘 검색
//!
//! 청크 목록으로 인메모리 FTS5 테이블을 만들고 BM25로 순위를 매깁니다.
//! `porter` 토크나이저(영어 어간 추출)를 써서 "alternatives"와 "alternative"가
//! 같은 항으로 매칭됩니다. 벡터 인덱스와 임베딩 모델은 전혀 사용하지 않습니다.
//!
//! source: https://www.sqlite.org/fts5.html#the_bm25_function

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::chunker::Chunk;

/// BM25 검색 결과 (청크 위치 + 스코어)
#[derive(Debug, Clone, PartialEq)]
pub struct Bm25Hit {
    /// 입력 청크 목록에서의 위치
    pub position: usize,
    /// 양수로 변환된 BM25 스코어 (높을수록 관련)
    pub score: f32,
}

/// 인메모리 FTS5 BM25 인덱스
#[derive(Debug, Clone)]
pub struct Bm25Store {
    conn: Arc<Mutex<Connection>>,
}

impl Bm25Store {
    /// 청크 목록으로 인덱스 생성
    pub fn build(chunks: &[Chunk]) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;

        conn.execute(
            "CREATE VIRTUAL TABLE chunks_fts USING fts5(
                text,
                tokenize = 'porter unicode61'
            )",
            [],
        )
        .context("Failed to create FTS5 table (FTS5 unavailable?)")?;

        {
            let mut stmt = conn
                .prepare("INSERT INTO chunks_fts(rowid, text) VALUES (?1, ?2)")
                .context("Failed to prepare chunk insert")?;
            // rowid = 위치 + 1 (0은 SQLite에서 피함)
            for (i, chunk) in chunks.iter().enumerate() {
                stmt.execute(params![i as i64 + 1, chunk.text])
                    .context("Failed to insert chunk into FTS5")?;
            }
        }

        tracing::debug!("Built BM25 index over {} chunks", chunks.len());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// BM25 검색
    ///
    /// 질의어는 OR로 결합되며, 동점은 청크 순서로 정렬됩니다.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Bm25Hit>> {
        let fts_query = build_fts5_query(query);
        if fts_query.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT rowid, bm25(chunks_fts) AS score
            FROM chunks_fts
            WHERE chunks_fts MATCH ?1
            ORDER BY score, rowid
            LIMIT ?2
            "#,
        )?;

        let hits = stmt
            .query_map(params![fts_query, limit as i64], |row| {
                let rowid: i64 = row.get(0)?;
                let score: f64 = row.get(1)?;
                Ok(Bm25Hit {
                    position: (rowid - 1) as usize,
                    // FTS5 bm25()는 음수일수록 관련도가 높음
                    score: -score as f32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read BM25 results")?;

        Ok(hits)
    }
}

/// FTS5 질의 구성
///
/// 특수 문자를 제거하고 각 단어를 따옴표로 감싼 뒤 OR로 결합합니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn build_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================
