//! Error types for the `ragbot-kb` crate.

use thiserror::Error;

/// Errors that can occur in knowledge-base operations.
///
/// Raw [`EmbeddingProvider`](crate::EmbeddingProvider) implementations report
/// [`ProviderTransient`](KbError::ProviderTransient) or
/// [`ProviderRejected`](KbError::ProviderRejected); the
/// [`EmbeddingClient`](crate::EmbeddingClient) turns those into
/// [`EmbeddingUnavailable`](KbError::EmbeddingUnavailable) once retries are
/// exhausted, or [`InvalidInput`](KbError::InvalidInput) for a single bad chunk.
#[derive(Debug, Error)]
pub enum KbError {
    /// No extractor is registered for the requested format.
    #[error("Unsupported format: {format}")]
    UnsupportedFormat {
        /// The declared or inferred format tag.
        format: String,
    },

    /// The raw bytes could not be parsed as the declared format.
    #[error("Corrupt document ({format}): {message}")]
    CorruptDocument {
        /// The format the extractor attempted to parse.
        format: String,
        /// A description of the failure.
        message: String,
    },

    /// An input was permanently rejected (empty text, bad parameters).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The embedding provider kept failing transiently until the retry
    /// budget ran out. Retryable at a higher level.
    #[error("Embedding unavailable ({provider}) after {attempts} attempt(s): {message}")]
    EmbeddingUnavailable {
        /// The embedding provider that produced the error.
        provider: String,
        /// How many attempts were made.
        attempts: u32,
        /// The last failure observed.
        message: String,
    },

    /// A transient provider failure (rate limit, timeout, 5xx).
    #[error("Transient provider error ({provider}): {message}")]
    ProviderTransient {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A permanent provider failure for the submitted input.
    #[error("Provider rejected input ({provider}): {message}")]
    ProviderRejected {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A cache record could not be decoded. Never escapes the cache layer.
    #[error("Corrupt cache entry for '{document_id}': {message}")]
    CacheCorrupt {
        /// The document whose cache record is unreadable.
        document_id: String,
        /// A description of the failure.
        message: String,
    },

    /// A vector's length differs from the dimension fixed by the index.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The dimension already in use.
        expected: usize,
        /// The offending vector's dimension.
        actual: usize,
    },

    /// An ingest did not finish within the configured timeout.
    #[error("Ingest of '{document_id}' timed out after {seconds}s")]
    IngestTimeout {
        /// The document being ingested.
        document_id: String,
        /// The configured timeout.
        seconds: u64,
    },

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An I/O error from the cache backend or directory scanning.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KbError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderTransient { .. } | Self::EmbeddingUnavailable { .. })
    }
}

/// A convenience result type for knowledge-base operations.
pub type Result<T> = std::result::Result<T, KbError>;
