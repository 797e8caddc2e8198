//! # Knowledge Base Console
//!
//! Mirrors a knowledge directory into a persistent knowledge base backed by
//! OpenAI embeddings, then answers questions typed on stdin with the
//! retrieved context and its sources.
//!
//! Reads `.env` for `OPENAI_API_KEY` and any `KnowledgeBaseConfig` keys
//! (`CHUNK_SIZE`, `SIMILARITY_THRESHOLD`, `KNOWLEDGE_BASE_DIR`, ...).
//! Embeddings are cached under `EMBEDDINGS_CACHE_DIR`, so a second run
//! makes no embedding calls for unchanged files.
//!
//! Run: `cargo run -p ragbot-demos --example kb_console --features openai -- --mode kb_only`

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ragbot_kb::{
    KnowledgeBase, KnowledgeBaseConfig, OpenAIEmbeddingProvider, QueryMode, RetrievalStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "kb-console", about = "Query a directory of documents")]
struct Args {
    /// Directory to sync (defaults to KNOWLEDGE_BASE_DIR or ./knowledge_base).
    #[arg(long)]
    dir: Option<PathBuf>,

    /// hybrid, kb_only or general.
    #[arg(long, default_value = "hybrid")]
    mode: QueryMode,

    /// Override the number of chunks retrieved per question.
    #[arg(long)]
    top_k: Option<usize>,

    /// Emit JSON logs instead of the compact format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.json_logs {
        ragbot_telemetry::init_json_telemetry("kb-console")?;
    } else {
        ragbot_telemetry::init_telemetry("kb-console")?;
    }

    let mut config = KnowledgeBaseConfig::from_env()?;
    if let Some(top_k) = args.top_k {
        config.top_k = top_k;
        config.validate()?;
    }
    let dir = args.dir.unwrap_or_else(|| config.knowledge_base_dir.clone());

    let provider = Arc::new(OpenAIEmbeddingProvider::from_env()?);
    let kb = KnowledgeBase::open(config, provider).await?;

    tokio::fs::create_dir_all(&dir).await?;
    let report = kb.sync_directory(&dir).await?;
    for entry in &report.ingested {
        println!("{:<40} {}", entry.document_id, entry.state);
    }
    for id in &report.removed {
        println!("{id:<40} removed");
    }

    let stats = kb.stats().await;
    println!(
        "\n{} documents, {} chunks ({:?}). Mode: {}. Ask a question (Ctrl-D to quit).",
        stats.document_count, stats.chunk_count, stats.status, args.mode
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }

        match kb.query(question, args.mode).await {
            Ok(context) => match context.status {
                RetrievalStatus::Found => {
                    println!("\n{}\n", context.context_text);
                    println!("Sources: {}", context.citations.join(", "));
                }
                RetrievalStatus::NoRelevantDocuments if !context.allows_general_knowledge() => {
                    println!("No relevant documents in the knowledge base.");
                }
                RetrievalStatus::NoRelevantDocuments => {
                    println!("Nothing relevant found; answer from general knowledge.");
                }
                RetrievalStatus::Skipped => println!("Retrieval skipped (general mode)."),
            },
            Err(e) => eprintln!("query failed: {e}"),
        }
    }

    Ok(())
}
