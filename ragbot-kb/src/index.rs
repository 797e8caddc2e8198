//! Similarity index over embedded chunks.
//!
//! [`LinearIndex`] scores every stored vector against the query with cosine
//! similarity. Results are ordered by descending score; equal scores keep
//! insertion order, so ranking is deterministic for a given ingest history.

use std::collections::BTreeSet;

use crate::document::{Chunk, SearchResult};
use crate::error::{KbError, Result};

/// An in-memory store of `(chunk, vector)` pairs supporting top-k search.
///
/// Mutation takes `&mut self`; the [`KnowledgeBase`](crate::KnowledgeBase)
/// serialises writers behind a lock while readers search concurrently.
pub trait SimilarityIndex: Send + Sync {
    /// Insert one entry.
    ///
    /// # Errors
    ///
    /// [`KbError::DimensionMismatch`] if the vector length differs from the
    /// index dimension, [`KbError::InvalidInput`] for an empty vector.
    fn add(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<()>;

    /// Remove every entry of a document, returning how many were removed.
    fn remove(&mut self, document_id: &str) -> usize;

    /// Up to `k` entries scoring at least `threshold`, best first.
    ///
    /// `k == 0` or an empty index yields an empty result.
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<SearchResult>>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Whether the index holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension in use, `None` while empty.
    fn dimensions(&self) -> Option<usize>;

    /// Distinct document identities present, sorted.
    fn document_ids(&self) -> Vec<String>;

    /// Number of entries belonging to `document_id`.
    fn chunk_count_for(&self, document_id: &str) -> usize;

    /// A new, empty index of the same kind.
    fn empty_like(&self) -> Box<dyn SimilarityIndex>;

    /// Replace all of a document's entries in one step.
    ///
    /// Every vector is checked before anything is touched, so on error the
    /// previous entries remain.
    fn replace_document(
        &mut self,
        document_id: &str,
        entries: Vec<(Chunk, Vec<f32>)>,
    ) -> Result<usize> {
        let remaining = self.len() - self.chunk_count_for(document_id);
        let mut expected = if remaining == 0 { None } else { self.dimensions() };
        for (_, vector) in &entries {
            if vector.is_empty() {
                return Err(KbError::InvalidInput("cannot index an empty vector".to_string()));
            }
            match expected {
                Some(dim) if dim != vector.len() => {
                    return Err(KbError::DimensionMismatch { expected: dim, actual: vector.len() });
                }
                _ => expected = Some(vector.len()),
            }
        }

        self.remove(document_id);
        let count = entries.len();
        for (chunk, vector) in entries {
            self.add(chunk, vector)?;
        }
        Ok(count)
    }
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Brute-force cosine index backed by an insertion-ordered `Vec`.
///
/// # Example
///
/// ```rust,ignore
/// use ragbot_kb::{LinearIndex, SimilarityIndex};
///
/// let mut index = LinearIndex::new();
/// index.add(chunk, vector)?;
/// let hits = index.search(&query, 3, 0.7)?;
/// ```
#[derive(Debug, Default, Clone)]
pub struct LinearIndex {
    entries: Vec<(Chunk, Vec<f32>)>,
    dimensions: Option<usize>,
}

impl LinearIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SimilarityIndex for LinearIndex {
    fn add(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(KbError::InvalidInput("cannot index an empty vector".to_string()));
        }
        match self.dimensions {
            Some(expected) if expected != vector.len() => {
                return Err(KbError::DimensionMismatch { expected, actual: vector.len() });
            }
            Some(_) => {}
            None => self.dimensions = Some(vector.len()),
        }
        self.entries.push((chunk, vector));
        Ok(())
    }

    fn remove(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(chunk, _)| chunk.document_id != document_id);
        if self.entries.is_empty() {
            self.dimensions = None;
        }
        before - self.entries.len()
    }

    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<SearchResult>> {
        let Some(expected) = self.dimensions else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != expected {
            return Err(KbError::DimensionMismatch { expected, actual: query.len() });
        }

        let mut scored: Vec<SearchResult> = self
            .entries
            .iter()
            .filter_map(|(chunk, vector)| {
                let score = cosine_similarity(vector, query);
                (score >= threshold).then(|| SearchResult { chunk: chunk.clone(), score })
            })
            .collect();

        // Stable: ties stay in insertion order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    fn document_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(chunk, _)| chunk.document_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn chunk_count_for(&self, document_id: &str) -> usize {
        self.entries.iter().filter(|(chunk, _)| chunk.document_id == document_id).count()
    }

    fn empty_like(&self) -> Box<dyn SimilarityIndex> {
        Box::new(LinearIndex::new())
    }
}
