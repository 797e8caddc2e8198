//! Retrieval orchestrator.
//!
//! [`KnowledgeBase`] runs the ingest path (extract → chunk → embed → index)
//! and the query path (embed → search → assemble context). It owns the
//! embedding cache and the similarity index; construct one per process and
//! share it by reference.
//!
//! # Example
//!
//! ```rust,ignore
//! use ragbot_kb::{KnowledgeBase, KnowledgeBaseConfig, QueryMode};
//!
//! let kb = KnowledgeBase::builder()
//!     .config(KnowledgeBaseConfig::default())
//!     .embedding_provider(Arc::new(my_embedder))
//!     .build()?;
//!
//! kb.ingest("faq.md", &bytes, None).await;
//! let context = kb.query("How do refunds work?", QueryMode::Hybrid).await?;
//! println!("{}", context.context_text);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cache::{CacheEntry, CacheKey, EmbeddingCache, FileCacheBackend};
use crate::chunking::{Chunker, FixedSizeChunker};
use crate::client::{EmbeddingClient, EmbeddingSlot};
use crate::config::KnowledgeBaseConfig;
use crate::document::{Chunk, DocumentFormat, SearchResult};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, Result};
use crate::extract::ExtractorRegistry;
use crate::index::{LinearIndex, SimilarityIndex};

/// How a query should use the knowledge base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Retrieve context; the caller may blend in general knowledge.
    #[default]
    Hybrid,
    /// Answer only from retrieved context.
    #[serde(alias = "kb_only")]
    KnowledgeBaseOnly,
    /// Skip retrieval.
    General,
}

impl QueryMode {
    /// The canonical snake_case tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::KnowledgeBaseOnly => "knowledge_base_only",
            Self::General => "general",
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "knowledge_base_only" | "kb_only" => Ok(Self::KnowledgeBaseOnly),
            "general" => Ok(Self::General),
            other => Err(KbError::InvalidInput(format!("unknown query mode '{other}'"))),
        }
    }
}

/// Outcome of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStatus {
    /// At least one chunk was placed in the context.
    Found,
    /// Nothing relevant was found. In knowledge-base-only mode the caller
    /// must report this instead of answering from general knowledge.
    NoRelevantDocuments,
    /// Retrieval was not attempted ([`QueryMode::General`]).
    Skipped,
}

/// Context assembled for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// The mode the query ran in.
    pub mode: QueryMode,
    /// Whether anything was found.
    pub status: RetrievalStatus,
    /// `[Source: id]` blocks separated by blank lines.
    pub context_text: String,
    /// Distinct source documents, best-scoring first.
    pub citations: Vec<String>,
    /// The chunks placed in `context_text`, in rank order.
    pub results: Vec<SearchResult>,
}

impl RetrievedContext {
    fn empty(mode: QueryMode, status: RetrievalStatus) -> Self {
        Self { mode, status, context_text: String::new(), citations: Vec::new(), results: Vec::new() }
    }

    /// Whether the response layer may fall back to general knowledge.
    pub fn allows_general_knowledge(&self) -> bool {
        self.mode != QueryMode::KnowledgeBaseOnly
    }
}

/// Why an ingest ended in [`DocumentState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No extractor handles the format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// The bytes could not be parsed or read.
    #[error("corrupt document: {0}")]
    CorruptDocument(String),
    /// Every embeddable chunk failed after retries.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// The ingest exceeded its time budget.
    #[error("timed out after {0}s")]
    TimedOut(u64),
    /// The vectors could not be placed in the index.
    #[error("indexing failed: {0}")]
    Indexing(String),
}

impl From<KbError> for FailureReason {
    fn from(error: KbError) -> Self {
        match error {
            KbError::UnsupportedFormat { format } => Self::UnsupportedFormat(format),
            KbError::CorruptDocument { message, .. } => Self::CorruptDocument(message),
            KbError::Io(e) => Self::CorruptDocument(e.to_string()),
            e @ (KbError::EmbeddingUnavailable { .. } | KbError::ProviderTransient { .. }) => {
                Self::EmbeddingUnavailable(e.to_string())
            }
            KbError::IngestTimeout { seconds, .. } => Self::TimedOut(seconds),
            other => Self::Indexing(other.to_string()),
        }
    }
}

/// Lifecycle of a document inside the knowledge base.
///
/// `Uploaded → Extracting → Chunking → Embedding → Indexed`, with `Failed`
/// reachable from every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DocumentState {
    /// Accepted, not yet processed.
    Uploaded,
    /// Converting bytes to text.
    Extracting,
    /// Splitting text into chunks.
    Chunking,
    /// Computing or reusing vectors.
    Embedding,
    /// Searchable.
    Indexed {
        /// Chunks placed in the index.
        chunk_count: usize,
        /// Chunks skipped or left unembedded.
        warnings: usize,
    },
    /// The last ingest attempt failed. A previously indexed version stays
    /// searchable.
    Failed(FailureReason),
}

impl DocumentState {
    /// Short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Indexed { .. } => "indexed",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether the state is `Indexed` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Indexed { .. } | Self::Failed(_))
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Indexed { chunk_count, warnings } => {
                write!(f, "indexed ({chunk_count} chunks, {warnings} warnings)")
            }
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// A document queued for [`KnowledgeBase::ingest_batch`].
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Stable identity.
    pub document_id: String,
    /// File contents.
    pub raw: Vec<u8>,
    /// Declared format; inferred from the id's extension when `None`.
    pub format: Option<DocumentFormat>,
}

impl IngestRequest {
    /// A request whose format is inferred from `document_id`.
    pub fn new(document_id: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self { document_id: document_id.into(), raw: raw.into(), format: None }
    }

    /// Declare the format explicitly.
    pub fn with_format(mut self, format: DocumentFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// Final state of one ingested document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// The document.
    pub document_id: String,
    /// Where it ended up.
    pub state: DocumentState,
}

/// Result of [`KnowledgeBase::sync_directory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Every supported file found, with its ingest outcome.
    pub ingested: Vec<IngestReport>,
    /// Previously synced documents whose files are gone.
    pub removed: Vec<String>,
    /// Files skipped for having no supported extension.
    pub ignored: Vec<String>,
}

/// Whether anything is searchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeBaseStatus {
    /// At least one chunk is indexed.
    Ready,
    /// The index is empty.
    Empty,
}

/// Per-document line of [`KnowledgeBaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    /// The document.
    pub id: String,
    /// Declared or inferred format.
    pub format: Option<DocumentFormat>,
    /// Chunks currently searchable.
    pub chunk_count: usize,
    /// Last recorded state.
    pub state: DocumentState,
}

/// Snapshot of what the knowledge base holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    /// Documents known to the knowledge base.
    pub document_count: usize,
    /// Chunks in the index.
    pub chunk_count: usize,
    /// Overall readiness.
    pub status: KnowledgeBaseStatus,
    /// One entry per document, sorted by id.
    pub documents: Vec<DocumentSummary>,
}

#[derive(Debug, Clone)]
struct DocumentRecord {
    format: Option<DocumentFormat>,
    state: DocumentState,
    synced: bool,
}

struct Prepared {
    entries: Vec<CacheEntry>,
    cached: usize,
    warnings: usize,
}

/// The knowledge-base service.
///
/// Index mutations take the write half of a read-write lock, so queries
/// never observe a half-replaced document. Rebuilds construct a fresh index
/// and swap it in. Commits, deletions and rebuilds are serialised with each
/// other so a swap never discards a concurrent commit.
pub struct KnowledgeBase {
    config: KnowledgeBaseConfig,
    client: EmbeddingClient,
    chunker: Arc<dyn Chunker>,
    extractors: ExtractorRegistry,
    cache: EmbeddingCache,
    index: RwLock<Box<dyn SimilarityIndex>>,
    documents: RwLock<HashMap<String, DocumentRecord>>,
    mutations: Mutex<()>,
}

impl KnowledgeBase {
    /// Create a new [`KnowledgeBaseBuilder`].
    pub fn builder() -> KnowledgeBaseBuilder {
        KnowledgeBaseBuilder::default()
    }

    /// Build a knowledge base persisting embeddings under
    /// `config.embeddings_cache_dir`, and load whatever is cached there.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::ConfigError`] for invalid configuration or
    /// [`KbError::Io`] if the cache directory cannot be listed.
    pub async fn open(
        config: KnowledgeBaseConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let cache = EmbeddingCache::with_backend(FileCacheBackend::new(
            config.embeddings_cache_dir.clone(),
        ))
        .with_capacity(config.cache_capacity);
        let kb = Self::builder().config(config).embedding_provider(provider).cache(cache).build()?;
        kb.rebuild_index().await?;
        Ok(kb)
    }

    /// Return a reference to the configuration.
    pub fn config(&self) -> &KnowledgeBaseConfig {
        &self.config
    }

    /// Return a reference to the embedding client.
    pub fn embedding_client(&self) -> &EmbeddingClient {
        &self.client
    }

    /// Return a reference to the embedding cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// The recorded state of a document.
    pub async fn document_state(&self, document_id: &str) -> Option<DocumentState> {
        self.documents.read().await.get(document_id).map(|record| record.state.clone())
    }

    /// Ingest one document and return its final state.
    ///
    /// The format is `declared_format` or inferred from the id's extension.
    /// Extraction and embedding are bounded by the configured ingest timeout.
    /// Nothing in the index changes unless the document reaches `Indexed`,
    /// in which case its previous chunks are replaced in one step.
    pub async fn ingest(
        &self,
        document_id: &str,
        raw: &[u8],
        declared_format: Option<DocumentFormat>,
    ) -> DocumentState {
        let format = declared_format.or_else(|| DocumentFormat::from_path(document_id));
        self.transition(document_id, format, DocumentState::Uploaded).await;

        let prepared = match tokio::time::timeout(
            self.config.ingest_timeout(),
            self.prepare(document_id, raw, format),
        )
        .await
        {
            Ok(prepared) => prepared,
            Err(_) => Err(KbError::IngestTimeout {
                document_id: document_id.to_string(),
                seconds: self.config.ingest_timeout_secs,
            }),
        };

        let state = match prepared {
            Ok(prepared) => self.commit(document_id, prepared).await,
            Err(e) => Err(e),
        };
        let state = state.unwrap_or_else(|e| {
            error!(document.id = %document_id, error = %e, "ingest failed");
            DocumentState::Failed(FailureReason::from(e))
        });

        self.transition(document_id, format, state.clone()).await;
        state
    }

    /// Ingest documents in order. One failure never stops the rest.
    pub async fn ingest_batch(&self, requests: Vec<IngestRequest>) -> Vec<IngestReport> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            let state = self.ingest(&request.document_id, &request.raw, request.format).await;
            reports.push(IngestReport { document_id: request.document_id, state });
        }
        let failed = reports.iter().filter(|r| matches!(r.state, DocumentState::Failed(_))).count();
        info!(documents = reports.len(), failed, "batch ingest finished");
        reports
    }

    /// Remove a document from the index, the cache and the registry.
    ///
    /// Returns `false` if the document was unknown.
    pub async fn delete(&self, document_id: &str) -> bool {
        let _mutation = self.mutations.lock().await;
        let removed_chunks = self.index.write().await.remove(document_id);
        let known = self.documents.write().await.remove(document_id).is_some();
        if let Err(e) = self.cache.invalidate(document_id).await {
            warn!(document.id = %document_id, error = %e, "failed to drop cached embeddings");
        }

        let existed = known || removed_chunks > 0;
        if existed {
            info!(document.id = %document_id, removed_chunks, "deleted document");
        }
        existed
    }

    /// Retrieve context for `query`.
    ///
    /// # Errors
    ///
    /// - [`KbError::InvalidInput`] if `k == 0`, `threshold` is outside
    ///   `[0, 1]` or the query is empty. An empty index is reported as
    ///   [`RetrievalStatus::NoRelevantDocuments`] before the query is looked at
    /// - [`KbError::EmbeddingUnavailable`] if the query cannot be embedded
    pub async fn answer_context(
        &self,
        query: &str,
        mode: QueryMode,
        k: usize,
        threshold: f32,
    ) -> Result<RetrievedContext> {
        if k == 0 {
            return Err(KbError::InvalidInput("k must be a positive integer".to_string()));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(KbError::InvalidInput(format!("threshold {threshold} is outside [0, 1]")));
        }
        if mode == QueryMode::General {
            debug!(%mode, "retrieval skipped");
            return Ok(RetrievedContext::empty(mode, RetrievalStatus::Skipped));
        }
        if self.index.read().await.is_empty() {
            info!(%mode, "knowledge base is empty");
            return Ok(RetrievedContext::empty(mode, RetrievalStatus::NoRelevantDocuments));
        }
        if query.trim().is_empty() {
            return Err(KbError::InvalidInput("query text is empty".to_string()));
        }

        let vector = self.client.embed_query(query).await?;
        let results = self.index.read().await.search(&vector, k, threshold)?;
        info!(%mode, k, threshold, result_count = results.len(), "search completed");

        if results.is_empty() {
            return Ok(RetrievedContext::empty(mode, RetrievalStatus::NoRelevantDocuments));
        }
        Ok(self.assemble(mode, results))
    }

    /// [`answer_context`](Self::answer_context) with the configured
    /// `top_k` and `similarity_threshold`.
    pub async fn query(&self, query: &str, mode: QueryMode) -> Result<RetrievedContext> {
        self.answer_context(query, mode, self.config.top_k, self.config.similarity_threshold).await
    }

    /// Make the knowledge base mirror a directory.
    ///
    /// Every file with a supported extension is ingested under its path
    /// relative to `dir` (with `/` separators). Documents added by an earlier
    /// sync whose files have disappeared are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::Io`] if the directory cannot be walked.
    pub async fn sync_directory(&self, dir: impl AsRef<Path>) -> Result<SyncReport> {
        let root = dir.as_ref();
        let mut report = SyncReport::default();
        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            match DocumentFormat::from_path(path) {
                Some(format) => files.push((id, path.to_path_buf(), format)),
                None => {
                    debug!(path = %path.display(), "ignoring unsupported file");
                    report.ignored.push(id);
                }
            }
        }

        let mut present = HashSet::with_capacity(files.len());
        for (id, path, format) in files {
            let state = match tokio::fs::read(&path).await {
                Ok(raw) => self.ingest(&id, &raw, Some(format)).await,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read knowledge file");
                    let state = DocumentState::Failed(FailureReason::CorruptDocument(e.to_string()));
                    self.transition(&id, Some(format), state.clone()).await;
                    state
                }
            };
            if let Some(record) = self.documents.write().await.get_mut(&id) {
                record.synced = true;
            }
            if let Err(e) = self.cache.set_synced(&id, true).await {
                warn!(document.id = %id, error = %e, "failed to persist sync origin");
            }
            present.insert(id.clone());
            report.ingested.push(IngestReport { document_id: id, state });
        }

        let mut stale: BTreeSet<String> = self
            .documents
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.synced)
            .map(|(id, _)| id.clone())
            .collect();
        match self.cache.synced_documents().await {
            Ok(persisted) => stale.extend(persisted),
            Err(e) => warn!(error = %e, "failed to read persisted sync origins"),
        }
        stale.retain(|id| !present.contains(id));
        for id in stale {
            self.delete(&id).await;
            report.removed.push(id);
        }

        info!(
            dir = %root.display(),
            ingested = report.ingested.len(),
            removed = report.removed.len(),
            ignored = report.ignored.len(),
            "directory synced"
        );
        Ok(report)
    }

    /// Rebuild the index from the cache and swap it in.
    ///
    /// Documents found in the cache are registered as `Indexed`, keeping
    /// whether they came from a directory sync. A cached
    /// document whose vectors disagree with the first document's dimension
    /// is skipped. Returns the number of chunks in the new index.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let _mutation = self.mutations.lock().await;
        let entries = self.cache.entries().await?;
        let synced: HashSet<String> = self.cache.synced_documents().await?.into_iter().collect();
        let mut snapshot = self.index.read().await.empty_like();

        let mut grouped: Vec<(String, Vec<(Chunk, Vec<f32>)>)> = Vec::new();
        for CacheEntry { chunk, vector } in entries {
            match grouped.last_mut() {
                Some((id, group)) if *id == chunk.document_id => group.push((chunk, vector)),
                _ => grouped.push((chunk.document_id.clone(), vec![(chunk, vector)])),
            }
        }

        let mut restored = Vec::with_capacity(grouped.len());
        for (id, group) in grouped {
            match snapshot.replace_document(&id, group) {
                Ok(count) => restored.push((id, count)),
                Err(e) => warn!(document.id = %id, error = %e, "skipping cached document"),
            }
        }

        let chunk_count = snapshot.len();
        *self.index.write().await = snapshot;

        let mut documents = self.documents.write().await;
        for (id, count) in &restored {
            let record = documents.entry(id.clone()).or_insert_with(|| DocumentRecord {
                format: DocumentFormat::from_path(id),
                state: DocumentState::Uploaded,
                synced: false,
            });
            record.synced = record.synced || synced.contains(id);
            match &mut record.state {
                DocumentState::Indexed { chunk_count, .. } => *chunk_count = *count,
                state => *state = DocumentState::Indexed { chunk_count: *count, warnings: 0 },
            }
        }
        info!(documents = restored.len(), chunks = chunk_count, "index rebuilt from cache");
        Ok(chunk_count)
    }

    /// Counts and per-document states.
    pub async fn stats(&self) -> KnowledgeBaseStats {
        let index = self.index.read().await;
        let documents = self.documents.read().await;

        let mut ids: BTreeSet<String> = documents.keys().cloned().collect();
        ids.extend(index.document_ids());

        let summaries: Vec<DocumentSummary> = ids
            .into_iter()
            .map(|id| {
                let chunk_count = index.chunk_count_for(&id);
                let record = documents.get(&id);
                DocumentSummary {
                    format: record.and_then(|r| r.format).or_else(|| DocumentFormat::from_path(&id)),
                    state: record
                        .map(|r| r.state.clone())
                        .unwrap_or(DocumentState::Indexed { chunk_count, warnings: 0 }),
                    chunk_count,
                    id,
                }
            })
            .collect();

        KnowledgeBaseStats {
            document_count: summaries.len(),
            chunk_count: index.len(),
            status: if index.is_empty() { KnowledgeBaseStatus::Empty } else { KnowledgeBaseStatus::Ready },
            documents: summaries,
        }
    }

    async fn transition(
        &self,
        document_id: &str,
        format: Option<DocumentFormat>,
        state: DocumentState,
    ) {
        match &state {
            DocumentState::Indexed { .. } | DocumentState::Failed(_) => {
                info!(document.id = %document_id, state = %state, "document state changed");
            }
            _ => debug!(document.id = %document_id, state = state.label(), "document state changed"),
        }

        let mut documents = self.documents.write().await;
        let record = documents.entry(document_id.to_string()).or_insert_with(|| DocumentRecord {
            format,
            state: DocumentState::Uploaded,
            synced: false,
        });
        record.format = format.or(record.format);
        record.state = state;
    }

    async fn prepare(
        &self,
        document_id: &str,
        raw: &[u8],
        format: Option<DocumentFormat>,
    ) -> Result<Prepared> {
        self.transition(document_id, format, DocumentState::Extracting).await;
        let format = format.ok_or_else(|| KbError::UnsupportedFormat {
            format: Path::new(document_id)
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string()),
        })?;
        let document = self.extractors.extract_document(document_id, format, raw.to_vec())?;
        debug!(
            document.id = %document.id,
            format = %document.format,
            bytes = document.raw.len(),
            chars = document.text.chars().count(),
            extracted_at = %document.extracted_at,
            "document extracted"
        );

        self.transition(document_id, Some(format), DocumentState::Chunking).await;
        let chunks = self.chunker.chunk(&document.id, &document.text);
        if chunks.is_empty() {
            warn!(document.id = %document_id, "document has no extractable text");
        }

        self.transition(document_id, Some(format), DocumentState::Embedding).await;
        self.embed_chunks(document_id, chunks).await
    }

    async fn embed_chunks(&self, document_id: &str, chunks: Vec<Chunk>) -> Result<Prepared> {
        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            vectors.push(self.cache.get(&CacheKey::for_chunk(chunk)).await);
        }

        let missing: Vec<usize> = (0..chunks.len()).filter(|&i| vectors[i].is_none()).collect();
        let cached = chunks.len() - missing.len();
        let texts: Vec<&str> = missing.iter().map(|&i| chunks[i].text.as_str()).collect();
        let slots = if texts.is_empty() { Vec::new() } else { self.client.embed_texts(&texts).await };

        let (mut skipped, mut unavailable) = (0usize, 0usize);
        let mut last_unavailable = None;
        for (&i, slot) in missing.iter().zip(slots) {
            match slot {
                EmbeddingSlot::Embedded(vector) => vectors[i] = Some(vector),
                EmbeddingSlot::Skipped(reason) => {
                    warn!(
                        document.id = %document_id,
                        chunk_index = chunks[i].index,
                        reason = %reason,
                        "skipping chunk"
                    );
                    skipped += 1;
                }
                EmbeddingSlot::Unavailable(reason) => {
                    unavailable += 1;
                    last_unavailable = Some(reason);
                }
            }
        }

        let entries: Vec<CacheEntry> = chunks
            .into_iter()
            .zip(vectors)
            .filter_map(|(chunk, vector)| vector.map(|vector| CacheEntry { chunk, vector }))
            .collect();

        if entries.is_empty() && unavailable > 0 {
            return Err(KbError::EmbeddingUnavailable {
                provider: self.client.provider().name().to_string(),
                attempts: self.config.retry_attempts,
                message: last_unavailable.unwrap_or_default(),
            });
        }
        if unavailable > 0 {
            warn!(document.id = %document_id, unavailable, "some chunks could not be embedded");
        }
        debug!(document.id = %document_id, cached, embedded = entries.len() - cached, skipped, "chunks embedded");

        Ok(Prepared { entries, cached, warnings: skipped + unavailable })
    }

    async fn commit(&self, document_id: &str, prepared: Prepared) -> Result<DocumentState> {
        let Prepared { entries, cached, warnings } = prepared;
        let _mutation = self.mutations.lock().await;
        let pairs: Vec<(Chunk, Vec<f32>)> =
            entries.iter().map(|e| (e.chunk.clone(), e.vector.clone())).collect();

        let chunk_count = self.index.write().await.replace_document(document_id, pairs)?;

        if let Err(e) = self.cache.put_document(document_id, entries).await {
            warn!(document.id = %document_id, error = %e, "failed to persist embeddings");
        }
        info!(document.id = %document_id, chunk_count, cached, warnings, "ingested document");
        Ok(DocumentState::Indexed { chunk_count, warnings })
    }

    fn assemble(&self, mode: QueryMode, results: Vec<SearchResult>) -> RetrievedContext {
        let limit = self.config.max_context_length;
        let total = results.len();
        let mut context_text = String::new();
        let mut used = 0usize;
        let mut included = Vec::with_capacity(total);

        for result in results {
            let block = format!("[Source: {}]\n{}", result.document_id(), result.chunk.text);
            let separator = if included.is_empty() { 0 } else { 2 };
            let length = separator + block.chars().count();
            if used + length > limit {
                break;
            }
            if separator > 0 {
                context_text.push_str("\n\n");
            }
            context_text.push_str(&block);
            used += length;
            included.push(result);
        }

        if included.len() < total {
            debug!(kept = included.len(), dropped = total - included.len(), limit, "context truncated");
        }
        if included.is_empty() {
            warn!(limit, "no retrieved chunk fits within max_context_length");
            return RetrievedContext::empty(mode, RetrievalStatus::NoRelevantDocuments);
        }

        let mut citations: Vec<String> = Vec::new();
        for result in &included {
            if !citations.iter().any(|id| id == result.document_id()) {
                citations.push(result.document_id().to_string());
            }
        }

        RetrievedContext { mode, status: RetrievalStatus::Found, context_text, citations, results: included }
    }
}

impl fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("config", &self.config)
            .field("provider", &self.client.provider().name())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Builder for constructing a [`KnowledgeBase`].
///
/// Only the embedding provider is required. Defaults: configuration from
/// [`KnowledgeBaseConfig::default`], a [`FixedSizeChunker`] sized by the
/// configuration, a [`LinearIndex`], an in-memory [`EmbeddingCache`] and the
/// default [`ExtractorRegistry`].
#[derive(Default)]
pub struct KnowledgeBaseBuilder {
    config: Option<KnowledgeBaseConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    chunker: Option<Arc<dyn Chunker>>,
    index: Option<Box<dyn SimilarityIndex>>,
    cache: Option<EmbeddingCache>,
    extractors: Option<ExtractorRegistry>,
}

impl KnowledgeBaseBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: KnowledgeBaseConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Override the chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Override the similarity index.
    pub fn index(mut self, index: Box<dyn SimilarityIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the embedding cache.
    pub fn cache(mut self, cache: EmbeddingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the extractor registry.
    pub fn extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = Some(extractors);
        self
    }

    /// Build the [`KnowledgeBase`].
    ///
    /// # Errors
    ///
    /// Returns [`KbError::ConfigError`] if the provider is missing or the
    /// configuration is invalid.
    pub fn build(self) -> Result<KnowledgeBase> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let provider = self
            .embedding_provider
            .ok_or_else(|| KbError::ConfigError("embedding_provider is required".to_string()))?;
        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(FixedSizeChunker::new(config.chunk_size, config.chunk_overlap)?),
        };

        Ok(KnowledgeBase {
            client: EmbeddingClient::from_config(provider, &config),
            chunker,
            extractors: self.extractors.unwrap_or_default(),
            cache: self
                .cache
                .unwrap_or_else(|| EmbeddingCache::in_memory().with_capacity(config.cache_capacity)),
            index: RwLock::new(self.index.unwrap_or_else(|| Box::new(LinearIndex::new()))),
            documents: RwLock::new(HashMap::new()),
            mutations: Mutex::new(()),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_mode_parses_aliases() {
        assert_eq!("kb_only".parse::<QueryMode>().unwrap(), QueryMode::KnowledgeBaseOnly);
        assert_eq!("Hybrid".parse::<QueryMode>().unwrap(), QueryMode::Hybrid);
        assert!("creative".parse::<QueryMode>().is_err());
        let mode: QueryMode = serde_json::from_str("\"kb_only\"").unwrap();
        assert_eq!(mode, QueryMode::KnowledgeBaseOnly);
    }

    #[test]
    fn failure_reasons_follow_error_kind() {
        let reason = FailureReason::from(KbError::UnsupportedFormat { format: "xlsx".into() });
        assert_eq!(reason, FailureReason::UnsupportedFormat("xlsx".into()));
        let reason =
            FailureReason::from(KbError::IngestTimeout { document_id: "a".into(), seconds: 5 });
        assert_eq!(reason, FailureReason::TimedOut(5));
    }

    #[test]
    fn state_serialises_with_tag() {
        let state = DocumentState::Indexed { chunk_count: 3, warnings: 1 };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "indexed");
        assert_eq!(json["detail"]["chunk_count"], 3);
        assert_eq!(state.to_string(), "indexed (3 chunks, 1 warnings)");
        assert!(state.is_terminal());
        assert!(!DocumentState::Embedding.is_terminal());
    }

    #[test]
    fn builder_requires_provider() {
        assert!(matches!(KnowledgeBase::builder().build(), Err(KbError::ConfigError(_))));
    }
}
