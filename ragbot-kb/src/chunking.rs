//! Document chunking.
//!
//! [`FixedSizeChunker`] advances a window of `chunk_size` characters over the
//! text in steps of `chunk_size - chunk_overlap`. Windows are measured in
//! Unicode scalar values so a chunk never splits a code point. The output is
//! a pure function of `(text, chunk_size, chunk_overlap)`; cache hits depend
//! on that.

use crate::document::Chunk;
use crate::error::{KbError, Result};

/// A strategy for splitting extracted text into chunks.
pub trait Chunker: Send + Sync {
    /// Split `text` into ordered chunks belonging to `document_id`.
    ///
    /// Returns an empty `Vec` if the text is empty.
    fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk>;
}

/// Splits text into fixed-size, overlapping character windows.
///
/// # Example
///
/// ```rust,ignore
/// use ragbot_kb::FixedSizeChunker;
///
/// let chunker = FixedSizeChunker::new(500, 50)?;
/// let chunks = chunker.chunk("faq.txt", &text);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`KbError::ConfigError`] unless `chunk_overlap < chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_overlap >= chunk_size {
            return Err(KbError::ConfigError(format!(
                "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self { chunk_size, chunk_overlap })
    }

    /// Maximum characters per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Characters shared by consecutive chunks.
    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        // Byte offset of every char boundary, plus the end of the string.
        let boundaries: Vec<usize> =
            text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len())).collect();
        let total = boundaries.len() - 1;
        let step = self.chunk_size - self.chunk_overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.chunk_size).min(total);
            let overlap = if chunks.is_empty() { 0 } else { self.chunk_overlap };
            chunks.push(Chunk::new(
                document_id,
                chunks.len(),
                &text[boundaries[start]..boundaries[end]],
                start,
                overlap,
            ));
            if end == total {
                break;
            }
            start += step;
        }

        chunks
    }
}

/// Rebuild the source text from a document's chunks by dropping each
/// chunk's overlapping prefix.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    for chunk in chunks {
        text.extend(chunk.text.chars().skip(chunk.overlap));
    }
    text
}
