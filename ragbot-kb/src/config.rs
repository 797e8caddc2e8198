//! Configuration for the knowledge base.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::RetryPolicy;
use crate::error::{KbError, Result};

/// Configuration parameters for the knowledge base.
///
/// Deserialises with every field optional; missing fields take the
/// [`Default`] values. Use [`KnowledgeBaseConfig::builder`] or
/// [`KnowledgeBaseConfig::from_env`] to get a validated value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// Number of results returned by [`query`](crate::KnowledgeBase::query).
    pub top_k: usize,
    /// Minimum cosine similarity for a chunk to be retrieved.
    pub similarity_threshold: f32,
    /// Maximum characters of assembled context.
    pub max_context_length: usize,
    /// Maximum inputs per embedding request.
    pub embedding_batch_size: usize,
    /// Maximum embedding requests in flight during one ingest.
    pub max_concurrent_batches: usize,
    /// Total attempts per embedding request, including the first.
    pub retry_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_initial_backoff_ms: u64,
    /// Upper bound on a retry delay, in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Growth factor between retry delays.
    pub retry_backoff_multiplier: f64,
    /// Upper bound on a single document ingest, in seconds.
    pub ingest_timeout_secs: u64,
    /// Maximum in-memory cache entries; `None` means unbounded.
    pub cache_capacity: Option<usize>,
    /// Directory scanned by [`sync_directory`](crate::KnowledgeBase::sync_directory).
    pub knowledge_base_dir: PathBuf,
    /// Root of the on-disk embedding cache.
    pub embeddings_cache_dir: PathBuf,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 3,
            similarity_threshold: 0.7,
            max_context_length: 2000,
            embedding_batch_size: 20,
            max_concurrent_batches: 4,
            retry_attempts: 4,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 8000,
            retry_backoff_multiplier: 2.0,
            ingest_timeout_secs: 120,
            cache_capacity: None,
            knowledge_base_dir: PathBuf::from("./knowledge_base"),
            embeddings_cache_dir: PathBuf::from("./embeddings_cache"),
        }
    }
}

impl KnowledgeBaseConfig {
    /// Create a new builder for constructing a [`KnowledgeBaseConfig`].
    pub fn builder() -> KnowledgeBaseConfigBuilder {
        KnowledgeBaseConfigBuilder::default()
    }

    /// Load from process environment variables, falling back to defaults.
    ///
    /// Recognised keys: `CHUNK_SIZE`, `CHUNK_OVERLAP`, `TOP_K`,
    /// `SIMILARITY_THRESHOLD`, `MAX_CONTEXT_LENGTH`, `EMBEDDING_BATCH_SIZE`,
    /// `MAX_CONCURRENT_BATCHES`, `RETRY_ATTEMPTS`, `RETRY_BACKOFF_MS`,
    /// `INGEST_TIMEOUT_SECS`, `CACHE_CAPACITY`, `KNOWLEDGE_BASE_DIR`,
    /// `EMBEDDINGS_CACHE_DIR`.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::ConfigError`] for unparsable values or an
    /// inconsistent result.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading keys through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| KbError::ConfigError(format!("{key}: cannot parse '{raw}'"))),
            }
        }

        let mut builder = Self::builder();
        if let Some(v) = parse(&lookup, "CHUNK_SIZE")? {
            builder = builder.chunk_size(v);
        }
        if let Some(v) = parse(&lookup, "CHUNK_OVERLAP")? {
            builder = builder.chunk_overlap(v);
        }
        if let Some(v) = parse(&lookup, "TOP_K")? {
            builder = builder.top_k(v);
        }
        if let Some(v) = parse(&lookup, "SIMILARITY_THRESHOLD")? {
            builder = builder.similarity_threshold(v);
        }
        if let Some(v) = parse(&lookup, "MAX_CONTEXT_LENGTH")? {
            builder = builder.max_context_length(v);
        }
        if let Some(v) = parse(&lookup, "EMBEDDING_BATCH_SIZE")? {
            builder = builder.embedding_batch_size(v);
        }
        if let Some(v) = parse(&lookup, "MAX_CONCURRENT_BATCHES")? {
            builder = builder.max_concurrent_batches(v);
        }
        if let Some(v) = parse(&lookup, "RETRY_ATTEMPTS")? {
            builder = builder.retry_attempts(v);
        }
        if let Some(v) = parse(&lookup, "RETRY_BACKOFF_MS")? {
            builder = builder.retry_initial_backoff_ms(v);
        }
        if let Some(v) = parse(&lookup, "INGEST_TIMEOUT_SECS")? {
            builder = builder.ingest_timeout_secs(v);
        }
        if let Some(v) = parse(&lookup, "CACHE_CAPACITY")? {
            builder = builder.cache_capacity(Some(v));
        }
        if let Some(dir) = lookup("KNOWLEDGE_BASE_DIR").filter(|d| !d.trim().is_empty()) {
            builder = builder.knowledge_base_dir(dir);
        }
        if let Some(dir) = lookup("EMBEDDINGS_CACHE_DIR").filter(|d| !d.trim().is_empty()) {
            builder = builder.embeddings_cache_dir(dir);
        }
        builder.build()
    }

    /// The retry policy described by the `retry_*` fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            multiplier: self.retry_backoff_multiplier,
        }
    }

    /// The ingest timeout as a [`Duration`].
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    /// Check that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::ConfigError`] if:
    /// - `chunk_overlap >= chunk_size`
    /// - `top_k`, `max_context_length`, `embedding_batch_size`,
    ///   `max_concurrent_batches`, `retry_attempts` or `ingest_timeout_secs` is zero
    /// - `similarity_threshold` is outside `[0, 1]`
    /// - `retry_backoff_multiplier < 1.0` or `retry_max_backoff_ms < retry_initial_backoff_ms`
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(KbError::ConfigError(message));

        if self.chunk_overlap >= self.chunk_size {
            return fail(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            ));
        }
        for (name, value) in [
            ("top_k", self.top_k),
            ("max_context_length", self.max_context_length),
            ("embedding_batch_size", self.embedding_batch_size),
            ("max_concurrent_batches", self.max_concurrent_batches),
            ("retry_attempts", self.retry_attempts as usize),
            ("ingest_timeout_secs", self.ingest_timeout_secs as usize),
        ] {
            if value == 0 {
                return fail(format!("{name} must be greater than zero"));
            }
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return fail(format!(
                "similarity_threshold ({}) must be within [0, 1]",
                self.similarity_threshold
            ));
        }
        if !(self.retry_backoff_multiplier >= 1.0) {
            return fail(format!(
                "retry_backoff_multiplier ({}) must be at least 1.0",
                self.retry_backoff_multiplier
            ));
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return fail("retry_max_backoff_ms must not be below retry_initial_backoff_ms".into());
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`KnowledgeBaseConfig`].
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBaseConfigBuilder {
    config: KnowledgeBaseConfig,
}

impl KnowledgeBaseConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the default number of results per query.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the minimum similarity threshold for retrieved chunks.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    /// Set the cap on assembled context length in characters.
    pub fn max_context_length(mut self, length: usize) -> Self {
        self.config.max_context_length = length;
        self
    }

    /// Set the provider batch-size cap.
    pub fn embedding_batch_size(mut self, size: usize) -> Self {
        self.config.embedding_batch_size = size;
        self
    }

    /// Set how many embedding batches may be in flight at once.
    pub fn max_concurrent_batches(mut self, count: usize) -> Self {
        self.config.max_concurrent_batches = count;
        self
    }

    /// Set the total attempts per embedding request.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    /// Set the first retry delay in milliseconds.
    ///
    /// The maximum delay is raised to match if it would fall below.
    pub fn retry_initial_backoff_ms(mut self, millis: u64) -> Self {
        self.config.retry_initial_backoff_ms = millis;
        self.config.retry_max_backoff_ms = self.config.retry_max_backoff_ms.max(millis);
        self
    }

    /// Set the retry delay cap in milliseconds.
    pub fn retry_max_backoff_ms(mut self, millis: u64) -> Self {
        self.config.retry_max_backoff_ms = millis;
        self
    }

    /// Set the retry delay growth factor.
    pub fn retry_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_backoff_multiplier = multiplier;
        self
    }

    /// Set the ingest timeout in seconds.
    pub fn ingest_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.ingest_timeout_secs = seconds;
        self
    }

    /// Cap the in-memory embedding cache; `None` disables eviction.
    pub fn cache_capacity(mut self, capacity: Option<usize>) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Set the knowledge directory.
    pub fn knowledge_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.knowledge_base_dir = dir.into();
        self
    }

    /// Set the embedding cache directory.
    pub fn embeddings_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.embeddings_cache_dir = dir.into();
        self
    }

    /// Build the [`KnowledgeBaseConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// See [`KnowledgeBaseConfig::validate`].
    pub fn build(self) -> Result<KnowledgeBaseConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
