//! Embedding client adapter: batching, retries and per-input failure
//! isolation in front of an [`EmbeddingProvider`].

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tracing::{debug, warn};

use crate::config::KnowledgeBaseConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, Result};

/// Exponential backoff for transient provider failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(self.max_backoff).min(self.max_backoff)
    }
}

/// Per-input result of [`EmbeddingClient::embed_texts`].
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingSlot {
    /// The input was embedded.
    Embedded(Vec<f32>),
    /// The input was permanently rejected and skipped.
    Skipped(String),
    /// The provider stayed unavailable for the whole retry budget.
    Unavailable(String),
}

impl EmbeddingSlot {
    /// The vector, if the input was embedded.
    pub fn vector(&self) -> Option<&[f32]> {
        match self {
            Self::Embedded(vector) => Some(vector),
            _ => None,
        }
    }
}

/// Wraps an [`EmbeddingProvider`] with batching, bounded concurrency and
/// retry-with-backoff.
///
/// - Inputs are split into batches of at most `batch_size`, issued
///   concurrently (at most `max_concurrency` in flight) and reassembled in
///   input order.
/// - Transient failures are retried per [`RetryPolicy`]; exhaustion marks
///   the batch's inputs [`EmbeddingSlot::Unavailable`].
/// - A permanently rejected batch is replayed one input at a time so only
///   the offending inputs end up [`EmbeddingSlot::Skipped`].
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_concurrency: usize,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    /// Create a client. Zero sizes are raised to one.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        max_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self { provider, batch_size: batch_size.max(1), max_concurrency: max_concurrency.max(1), retry }
    }

    /// Create a client using the batching and retry settings of `config`.
    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &KnowledgeBaseConfig) -> Self {
        Self::new(
            provider,
            config.embedding_batch_size,
            config.max_concurrent_batches,
            config.retry_policy(),
        )
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Dimensionality reported by the provider.
    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    /// Embed many inputs, returning exactly one slot per input in order.
    ///
    /// Never fails as a whole: the caller decides what a mix of embedded,
    /// skipped and unavailable inputs means.
    pub async fn embed_texts(&self, texts: &[&str]) -> Vec<EmbeddingSlot> {
        let mut slots: Vec<Option<EmbeddingSlot>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, &str)> = Vec::with_capacity(texts.len());

        for (index, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                warn!(provider = self.provider.name(), index, "skipping empty embedding input");
                slots[index] = Some(EmbeddingSlot::Skipped("empty input".to_string()));
            } else {
                pending.push((index, *text));
            }
        }

        let batches: Vec<Vec<(usize, &str)>> =
            pending.chunks(self.batch_size).map(<[_]>::to_vec).collect();
        debug!(
            provider = self.provider.name(),
            inputs = pending.len(),
            batches = batches.len(),
            "embedding inputs"
        );

        let results: Vec<Vec<(usize, EmbeddingSlot)>> = stream::iter(batches)
            .map(|batch| async move { self.embed_batch_slots(&batch).await })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        for (index, slot) in results.into_iter().flatten() {
            slots[index] = Some(slot);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| EmbeddingSlot::Unavailable("no result returned".to_string()))
            })
            .collect()
    }

    /// Embed a single query string.
    ///
    /// # Errors
    ///
    /// - [`KbError::InvalidInput`] for empty text or a provider rejection
    /// - [`KbError::EmbeddingUnavailable`] once retries are exhausted
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(KbError::InvalidInput("query text is empty".to_string()));
        }
        let vectors = self.call_with_retry(&[text]).await.map_err(|e| match e {
            KbError::ProviderRejected { message, .. } => KbError::InvalidInput(message),
            other => other,
        })?;
        vectors.into_iter().next().ok_or_else(|| {
            KbError::InvalidInput("provider returned no vector for the query".to_string())
        })
    }

    async fn embed_batch_slots(&self, batch: &[(usize, &str)]) -> Vec<(usize, EmbeddingSlot)> {
        let inputs: Vec<&str> = batch.iter().map(|(_, text)| *text).collect();

        match self.call_with_retry(&inputs).await {
            Ok(vectors) => batch
                .iter()
                .zip(vectors)
                .map(|((index, _), vector)| (*index, EmbeddingSlot::Embedded(vector)))
                .collect(),
            Err(e @ KbError::EmbeddingUnavailable { .. }) => {
                warn!(
                    provider = self.provider.name(),
                    batch_size = batch.len(),
                    error = %e,
                    "embedding batch unavailable"
                );
                let reason = e.to_string();
                batch.iter().map(|(index, _)| (*index, EmbeddingSlot::Unavailable(reason.clone()))).collect()
            }
            Err(e) if batch.len() == 1 => {
                let index = batch[0].0;
                self.skip(index, &e);
                vec![(index, EmbeddingSlot::Skipped(e.to_string()))]
            }
            Err(e) => {
                debug!(
                    provider = self.provider.name(),
                    batch_size = batch.len(),
                    error = %e,
                    "batch rejected, isolating inputs"
                );
                let mut slots = Vec::with_capacity(batch.len());
                for (index, text) in batch {
                    let slot = match self.call_with_retry(&[*text]).await {
                        Ok(vectors) => match vectors.into_iter().next() {
                            Some(vector) => EmbeddingSlot::Embedded(vector),
                            None => EmbeddingSlot::Skipped("no vector returned".to_string()),
                        },
                        Err(e @ KbError::EmbeddingUnavailable { .. }) => {
                            EmbeddingSlot::Unavailable(e.to_string())
                        }
                        Err(e) => {
                            self.skip(*index, &e);
                            EmbeddingSlot::Skipped(e.to_string())
                        }
                    };
                    slots.push((*index, slot));
                }
                slots
            }
        }
    }

    fn skip(&self, index: usize, error: &KbError) {
        warn!(
            provider = self.provider.name(),
            index,
            error = %error,
            "skipping input rejected by embedding provider"
        );
    }

    async fn call_with_retry(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider.name();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = self
                .provider
                .embed_batch(texts)
                .await
                .and_then(|vectors| self.validate(texts.len(), vectors));

            match outcome {
                Ok(vectors) => {
                    if attempt > 1 {
                        debug!(provider, attempt, "embedding succeeded after retry");
                    }
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient embedding failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(KbError::EmbeddingUnavailable {
                        provider: provider.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn validate(&self, expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        let rejected = |message: String| KbError::ProviderRejected {
            provider: self.provider.name().to_string(),
            message,
        };

        if vectors.len() != expected {
            return Err(rejected(format!("expected {expected} vector(s), got {}", vectors.len())));
        }
        let dimensions = self.provider.dimensions();
        for vector in &vectors {
            if dimensions > 0 && vector.len() != dimensions {
                return Err(rejected(format!(
                    "expected dimension {dimensions}, got {}",
                    vector.len()
                )));
            }
            if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
                return Err(rejected("vector is empty or contains non-finite values".to_string()));
            }
        }
        Ok(vectors)
    }
}
