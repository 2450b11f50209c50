//! CLI 모듈
//!
//! clinical-notes-rag CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::PipelineConfig;
use crate::embedding::list_embed_models;
use crate::knowledge::{initialize, RetrieverType};
use crate::pipeline::{notes_from_lines, KeyedTexts, QueryInput, QueryWorkflow};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "clinical-notes-rag")]
#[command(version, about = "임상 노트 기반 질의응답 파이프라인", long_about = None)]
pub struct Cli {
    /// 설정 파일 (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 벡터 저장소 경로 (":memory:"는 인메모리)
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 노트에 대해 질문
    Query(QueryArgs),

    /// 임베딩 모델 목록
    Models,

    /// 저장소 상태 확인
    Status,

    /// 컬렉션 삭제
    Reset,
}

#[derive(Args)]
pub struct QueryArgs {
    /// 입력 페이로드 (JSON 문자열 또는 JSON 파일 경로)
    #[arg(long, conflicts_with_all = ["notes", "narrative", "patient_question", "clinical_question"])]
    pub payload: Option<String>,

    /// 노트 파일 (한 줄에 발췌 하나)
    #[arg(short, long, required_unless_present = "payload")]
    pub notes: Option<PathBuf>,

    /// 환자 서술
    #[arg(long, default_value = "")]
    pub narrative: String,

    /// 환자 질문 (여러 번 지정 가능)
    #[arg(short, long = "patient-question")]
    pub patient_question: Vec<String>,

    /// 임상 질문
    #[arg(long = "clinical-question", default_value = "")]
    pub clinical_question: String,

    /// 검색기 타입 (base, bm25, auto_merger)
    #[arg(short, long)]
    pub retriever: Option<String>,

    /// 검색할 청크 수
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(storage) = cli.storage {
        config.storage.path = storage;
    }

    match cli.command {
        Commands::Query(args) => cmd_query(config, args).await,
        Commands::Models => cmd_models(&config),
        Commands::Status => cmd_status(&config).await,
        Commands::Reset => cmd_reset(&config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 질의 명령어 (query)
///
/// 워크플로우를 한 번 실행하고 출력 페이로드를 JSON으로 출력합니다.
async fn cmd_query(mut config: PipelineConfig, args: QueryArgs) -> Result<()> {
    if let Some(retriever) = &args.retriever {
        // 잘못된 타입은 실행 전에 거부
        retriever.parse::<RetrieverType>()?;
        config.retrieval.retriever_type = retriever.clone();
    }
    if args.top_k.is_some() {
        config.retrieval.top_k = args.top_k;
    }

    let input = build_input(&args)?;
    let workflow = QueryWorkflow::from_config(&config)
        .await
        .context("Failed to initialize pipeline")?;

    let output = workflow.process_query(input).await;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if output.error {
        bail!("Workflow stopped with an error");
    }
    if !output.relevant {
        eprintln!("[!] 질문이 노트와 관련이 없다고 판정되었습니다");
    }
    Ok(())
}

/// 인자에서 입력 페이로드 구성
fn build_input(args: &QueryArgs) -> Result<QueryInput> {
    if let Some(payload) = &args.payload {
        let json = if payload.trim_start().starts_with('{') {
            payload.clone()
        } else {
            std::fs::read_to_string(payload)
                .with_context(|| format!("Failed to read payload file: {}", payload))?
        };
        return Ok(QueryInput::from_json(&json)?);
    }

    let notes_path = args
        .notes
        .as_deref()
        .context("--notes or --payload is required")?;
    let notes = read_notes(notes_path)?;

    if args.patient_question.is_empty() && args.clinical_question.trim().is_empty() {
        bail!("Enter at least one of --patient-question or --clinical-question");
    }

    let patient_question: KeyedTexts = args
        .patient_question
        .iter()
        .enumerate()
        .map(|(i, q)| (i.to_string(), q.trim().to_string()))
        .collect();

    Ok(QueryInput::new(
        notes,
        patient_question,
        args.clinical_question.trim(),
        args.narrative.trim(),
    ))
}

fn read_notes(path: &Path) -> Result<KeyedTexts> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read notes file: {}", path.display()))?;
    let notes = notes_from_lines(&text);
    if notes.is_empty() {
        bail!("Notes file {} has no non-blank lines", path.display());
    }
    Ok(notes)
}

/// 모델 목록 명령어 (models)
fn cmd_models(config: &PipelineConfig) -> Result<()> {
    println!("[OK] 임베딩 모델 ({} 개):\n", list_embed_models().len());
    for spec in list_embed_models() {
        let marker = if spec.name == config.embedding.model { "*" } else { " " };
        println!(
            " {} {:<14} {:<42} dim={}",
            marker, spec.name, spec.model_id, spec.dimension
        );
    }
    Ok(())
}

/// 상태 명령어 (status)
///
/// 저장소의 컬렉션과 항목 수를 보여줍니다.
async fn cmd_status(config: &PipelineConfig) -> Result<()> {
    println!("clinical-notes-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 저장소: {}", config.storage.path.display());
    if config.storage.is_memory() {
        println!("[!] 인메모리 저장소는 명령 사이에 유지되지 않습니다.");
    }
    println!("[*] 임베딩 모델: {} ({})", config.embedding.model, config.embedding.endpoint);
    println!("[*] 관련성 모델: {} ({})", config.relevance.model, config.relevance.endpoint);
    println!("[*] 합성 모델: {} ({})", config.synthesis.model, config.synthesis.endpoint);
    println!("[*] 검색기: {}", config.retrieval.retriever_type);

    if config.relevance.api_key.is_none() && config.synthesis.api_key.is_none() {
        println!("[!] OPENROUTER_API_KEY: 미설정");
    }

    let store = initialize(&config.storage.path).await?;
    let collections = store.list_collections().await?;
    if collections.is_empty() {
        println!("[!] 저장된 컬렉션이 없습니다.");
        return Ok(());
    }

    for name in collections {
        match store.count(&name).await {
            Ok(count) => println!("[OK] 컬렉션 {}: {} 항목", name, count),
            Err(e) => println!("[!] 컬렉션 {}: 조회 실패 ({:#})", name, e),
        }
    }
    Ok(())
}

/// 초기화 명령어 (reset)
async fn cmd_reset(config: &PipelineConfig) -> Result<()> {
    let store = initialize(&config.storage.path).await?;
    let collection = &config.storage.collection;

    if !store.has_collection(collection).await? {
        println!("[!] 컬렉션 {}이(가) 없습니다.", collection);
        return Ok(());
    }

    store.delete_collection(collection).await?;
    println!("[OK] 컬렉션 {} 삭제됨", collection);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("clinical-notes-rag").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_parse_query_flags() {
        let cli = parse(&[
            "query",
            "--notes",
            "notes.txt",
            "-p",
            "What causes leg swelling?",
            "-p",
            "Is it serious?",
            "--clinical-question",
            "Alternatives to amlodipine?",
            "--retriever",
            "bm25",
            "-k",
            "3",
        ]);
        match cli.command {
            Commands::Query(args) => {
                assert_eq!(args.patient_question.len(), 2);
                assert_eq!(args.retriever.as_deref(), Some("bm25"));
                assert_eq!(args.top_k, Some(3));
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_query_requires_notes_or_payload() {
        let result = Cli::try_parse_from(["clinical-notes-rag", "query", "--narrative", "n"]);
        assert!(result.is_err());

        let result = Cli::try_parse_from([
            "clinical-notes-rag",
            "query",
            "--payload",
            "{}",
            "--notes",
            "notes.txt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_storage_flag() {
        let cli = parse(&["status", "--storage", ":memory:"]);
        assert_eq!(cli.storage, Some(PathBuf::from(":memory:")));
    }

    #[test]
    fn test_build_input_from_notes_file() {
        let temp_dir = TempDir::new().unwrap();
        let notes_path = temp_dir.path().join("notes.txt");
        std::fs::write(&notes_path, "Patient has stage 2 hypertension.\n\nPrescribed Losartan.\n").unwrap();

        let cli = parse(&[
            "query",
            "--notes",
            notes_path.to_str().unwrap(),
            "--narrative",
            " no other issues ",
            "--clinical-question",
            "what are alternatives to amlodipine",
        ]);
        let Commands::Query(args) = cli.command else {
            panic!("expected query");
        };

        let input = build_input(&args).unwrap();
        let validated = input.validate().unwrap();
        assert_eq!(validated.note_excerpts.get("2"), Some("Prescribed Losartan."));
        assert_eq!(validated.patient_narrative, "no other issues");
        assert!(validated.patient_question.is_empty());
    }

    #[test]
    fn test_build_input_from_payload() {
        let cli = parse(&[
            "query",
            "--payload",
            r#"{"note_excerpts": {"0": "Prescribed Losartan."}, "patient_question": {"0": "q"},
                "clinical_question": "c", "patient_narrative": "n"}"#,
        ]);
        let Commands::Query(args) = cli.command else {
            panic!("expected query");
        };
        let input = build_input(&args).unwrap();
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_build_input_requires_a_question() {
        let temp_dir = TempDir::new().unwrap();
        let notes_path = temp_dir.path().join("notes.txt");
        std::fs::write(&notes_path, "Prescribed Losartan.").unwrap();

        let cli = parse(&["query", "--notes", notes_path.to_str().unwrap()]);
        let Commands::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert!(build_input(&args).is_err());
    }

    #[tokio::test]
    async fn test_status_and_reset_on_empty_storage() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = PipelineConfig::default();
        config.storage.path = temp_dir.path().join("notes.lance");

        cmd_status(&config).await.unwrap();
        cmd_reset(&config).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_on_memory_storage() {
        let mut config = PipelineConfig::default();
        config.storage.path = PathBuf::from(":memory:");
        assert!(config.storage.is_memory());

        cmd_status(&config).await.unwrap();
    }
}
