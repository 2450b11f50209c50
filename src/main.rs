//! clinical-notes-rag CLI 진입점

use anyhow::Result;
use clap::Parser;

use clinical_notes_rag::cli::{run, Cli};

fn main() -> Result<()> {
    // 로그는 stderr로 (stdout은 JSON 출력 전용)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}
