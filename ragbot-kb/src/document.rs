//! Data types for documents, chunks, and search results.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KbError;

/// The source formats the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    /// UTF-8 plain text.
    PlainText,
    /// Portable Document Format.
    Pdf,
    /// Office Open XML word-processing document (`.docx`).
    Word,
    /// Comma-separated values.
    Csv,
    /// JSON.
    Json,
    /// Markdown.
    Markdown,
}

impl DocumentFormat {
    /// All known formats, in registry order.
    pub const ALL: [DocumentFormat; 6] = [
        DocumentFormat::PlainText,
        DocumentFormat::Pdf,
        DocumentFormat::Word,
        DocumentFormat::Csv,
        DocumentFormat::Json,
        DocumentFormat::Markdown,
    ];

    /// Map a file extension (without the dot, any case) to a format.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(Self::PlainText),
            "pdf" => Some(Self::Pdf),
            "docx" | "doc" => Some(Self::Word),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Infer the format from a path or document id's extension.
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        path.as_ref().extension().and_then(|ext| ext.to_str()).and_then(Self::from_extension)
    }

    /// The canonical lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "plaintext",
            Self::Pdf => "pdf",
            Self::Word => "word",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().trim_start_matches('.');
        match tag.to_ascii_lowercase().as_str() {
            "plaintext" | "plain" => Ok(Self::PlainText),
            "word" => Ok(Self::Word),
            other => Self::from_extension(other)
                .ok_or_else(|| KbError::UnsupportedFormat { format: s.to_string() }),
        }
    }
}

/// A source document after extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Stable identifier for the document.
    pub id: String,
    /// The format the raw bytes were parsed as.
    pub format: DocumentFormat,
    /// The bytes as uploaded.
    #[serde(skip)]
    pub raw: Vec<u8>,
    /// Normalised plain text produced by the extractor.
    pub text: String,
    /// When extraction finished.
    pub extracted_at: DateTime<Utc>,
}

/// A segment of a [`Document`]'s text, the unit of embedding and retrieval.
///
/// Offsets are character (not byte) positions into the extracted text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// The ID of the parent [`Document`].
    pub document_id: String,
    /// Position of this chunk within its document.
    pub index: usize,
    /// The text content of the chunk.
    pub text: String,
    /// Character offset of the first character.
    pub start: usize,
    /// Character offset one past the last character.
    pub end: usize,
    /// Number of leading characters shared with the previous chunk.
    pub overlap: usize,
    /// Hex SHA-256 of `text`.
    pub content_hash: String,
}

impl Chunk {
    /// Build a chunk, computing its content hash.
    pub fn new(
        document_id: impl Into<String>,
        index: usize,
        text: impl Into<String>,
        start: usize,
        overlap: usize,
    ) -> Self {
        let text = text.into();
        let end = start + text.chars().count();
        let content_hash = content_hash(&text);
        Self { document_id: document_id.into(), index, text, start, end, overlap, content_hash }
    }

    /// Unique identifier in the form `{document_id}_{index}`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.document_id, self.index)
    }
}

/// A retrieved [`Chunk`] paired with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// The cosine similarity score (higher is more relevant).
    pub score: f32,
}

impl SearchResult {
    /// The identity of the document the chunk came from.
    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }
}

/// Lowercase hex SHA-256 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A content-derived identity: `{name}#{first 12 hex chars of sha256(raw)}`.
pub fn document_identity(name: &str, raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    let digest = format!("{:x}", hasher.finalize());
    format!("{name}#{}", &digest[..12])
}
