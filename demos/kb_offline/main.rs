//! # Knowledge Base Offline Example
//!
//! Ingests a handful of documents in different formats, asks questions in
//! each query mode, then deletes a document and shows the effect.
//!
//! Uses a deterministic `KeywordEmbeddingProvider` (hashed bag of words) so
//! it runs with **zero API keys**.
//!
//! Run: `cargo run -p ragbot-demos --example kb_offline`

use std::sync::Arc;

use ragbot_kb::{
    DocumentFormat, EmbeddingProvider, IngestRequest, KnowledgeBase, KnowledgeBaseConfig,
    QueryMode, RetrievedContext,
};

// ---------------------------------------------------------------------------
// KeywordEmbeddingProvider: hashed bag-of-words vectors
// ---------------------------------------------------------------------------

struct KeywordEmbeddingProvider {
    dimensions: usize,
}

impl KeywordEmbeddingProvider {
    fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for KeywordEmbeddingProvider {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn embed(&self, text: &str) -> ragbot_kb::Result<Vec<f32>> {
        // Each lowercase word of 3+ letters bumps one bucket, so texts
        // sharing vocabulary point in similar directions.
        let mut emb = vec![0.0f32; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.len() >= 3)
        {
            let hash = word.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            emb[(hash % self.dimensions as u64) as usize] += 1.0;
        }
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            emb.iter_mut().for_each(|x| *x /= norm);
        } else {
            emb[0] = 1.0;
        }
        Ok(emb)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ---------------------------------------------------------------------------
// Sample documents
// ---------------------------------------------------------------------------

const FAQ_MARKDOWN: &str = r#"# Frequently Asked Questions

## Opening hours

The store is open **Monday to Friday** from 9am to 6pm, and on Saturday
from 10am to 4pm. We are closed on Sunday.

## Refunds

Refunds are accepted within 30 days of purchase with a receipt. Refunds
are paid back to the original payment method.
"#;

const PRICES_CSV: &str = "product,price,stock\n\
espresso machine,249,12\n\
coffee grinder,89,30\n\
milk frother,35,54\n";

const SHIPPING_JSON: &str = r#"{
  "shipping": {
    "domestic": {"days": "2-4", "cost": "free over 50"},
    "international": {"days": "7-14", "cost": "flat 25"}
  }
}"#;

const ABOUT_TEXT: &str = "Our coffee shop roasts beans every morning. \
We source beans from farms in Ethiopia, Colombia and Guatemala.";

fn print_context(query: &str, mode: QueryMode, context: &RetrievedContext) {
    println!("\nQuery ({mode}): \"{query}\"");
    println!("  status: {:?}", context.status);
    if context.citations.is_empty() {
        println!("  (no citations)");
    }
    for (i, result) in context.results.iter().enumerate() {
        let preview: String = result.chunk.text.chars().take(70).collect();
        println!("  {}. [score={:.3}] {} | {}", i + 1, result.score, result.document_id(), preview);
    }
    if !context.allows_general_knowledge() && context.citations.is_empty() {
        println!("  -> answer must say the knowledge base has no information on this");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ragbot_telemetry::init_telemetry("kb-offline")?;

    // -- 1. Configure -----------------------------------------------------
    // Small chunks keep each section separate; the keyword embedder gives
    // lower scores than a real model, so the threshold is relaxed.
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(200)
        .chunk_overlap(20)
        .top_k(3)
        .similarity_threshold(0.2)
        .max_context_length(600)
        .build()?;

    let kb = KnowledgeBase::builder()
        .config(config)
        .embedding_provider(Arc::new(KeywordEmbeddingProvider::new(128)))
        .build()?;

    // -- 2. Ingest --------------------------------------------------------
    let reports = kb
        .ingest_batch(vec![
            IngestRequest::new("faq.md", FAQ_MARKDOWN),
            IngestRequest::new("prices.csv", PRICES_CSV),
            IngestRequest::new("shipping.json", SHIPPING_JSON),
            IngestRequest::new("about", ABOUT_TEXT).with_format(DocumentFormat::PlainText),
            IngestRequest::new("catalogue.xlsx", vec![0u8; 16]),
        ])
        .await;

    println!("Ingested {} documents:", reports.len());
    for report in &reports {
        println!("  {} -> {}", report.document_id, report.state);
    }

    // -- 3. Query ---------------------------------------------------------
    let queries = [
        ("When is the store open on Saturday?", QueryMode::Hybrid),
        ("How much is the coffee grinder?", QueryMode::KnowledgeBaseOnly),
        ("international shipping cost", QueryMode::KnowledgeBaseOnly),
        ("Who won the football world cup?", QueryMode::KnowledgeBaseOnly),
        ("Tell me a joke", QueryMode::General),
    ];
    for (query, mode) in queries {
        let context = kb.query(query, mode).await?;
        print_context(query, mode, &context);
    }

    // -- 4. Delete and re-query -------------------------------------------
    println!("\nDeleting faq.md: {}", kb.delete("faq.md").await);
    let query = "When is the store open on Saturday?";
    let context = kb.query(query, QueryMode::KnowledgeBaseOnly).await?;
    print_context(query, QueryMode::KnowledgeBaseOnly, &context);

    // -- 5. Stats ---------------------------------------------------------
    let stats = kb.stats().await;
    println!("\n{}", serde_json::to_string_pretty(&stats)?);
    println!("cache: {:?}", kb.cache().stats().await);

    Ok(())
}
