//! # ragbot-kb
//!
//! Knowledge-base core for a retrieval-augmented chatbot.
//!
//! ## Overview
//!
//! Documents go in as raw bytes and come out as ranked, cited context:
//!
//! - [`ExtractorRegistry`] - plain text from text, PDF, Word, CSV, JSON and Markdown
//! - [`FixedSizeChunker`] - overlapping character windows
//! - [`EmbeddingClient`] - batching, retries and per-input isolation over an [`EmbeddingProvider`]
//! - [`EmbeddingCache`] - vectors keyed by document, chunk position and content hash
//! - [`LinearIndex`] - cosine top-k search with deterministic tie-breaks
//! - [`KnowledgeBase`] - the orchestrator tying them together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ragbot_kb::{KnowledgeBase, KnowledgeBaseConfig, QueryMode};
//!
//! let config = KnowledgeBaseConfig::from_env()?;
//! let kb = KnowledgeBase::open(config, Arc::new(my_embedder)).await?;
//! kb.sync_directory("./knowledge_base").await?;
//!
//! let context = kb.query("What are the opening hours?", QueryMode::KnowledgeBaseOnly).await?;
//! for source in &context.citations {
//!     println!("cited: {source}");
//! }
//! ```
//!
//! ## Features
//!
//! - `openai` - [`openai::OpenAIEmbeddingProvider`] over the OpenAI embeddings API

pub mod cache;
pub mod chunking;
pub mod client;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod knowledge_base;
#[cfg(feature = "openai")]
pub mod openai;

pub use cache::{CacheBackend, CacheEntry, CacheKey, CacheStats, EmbeddingCache, FileCacheBackend};
pub use chunking::{Chunker, FixedSizeChunker, reassemble};
pub use client::{EmbeddingClient, EmbeddingSlot, RetryPolicy};
pub use config::{KnowledgeBaseConfig, KnowledgeBaseConfigBuilder};
pub use document::{
    Chunk, Document, DocumentFormat, SearchResult, content_hash, document_identity,
};
pub use embedding::EmbeddingProvider;
pub use error::{KbError, Result};
pub use extract::{
    CsvExtractor, Extractor, ExtractorRegistry, JsonExtractor, MarkdownExtractor, PdfExtractor,
    PlainTextExtractor, WordExtractor, normalize_text,
};
pub use index::{LinearIndex, SimilarityIndex, cosine_similarity};
pub use knowledge_base::{
    DocumentState, DocumentSummary, FailureReason, IngestReport, IngestRequest, KnowledgeBase,
    KnowledgeBaseBuilder, KnowledgeBaseStats, KnowledgeBaseStatus, QueryMode, RetrievalStatus,
    RetrievedContext, SyncReport,
};
#[cfg(feature = "openai")]
pub use openai::OpenAIEmbeddingProvider;
