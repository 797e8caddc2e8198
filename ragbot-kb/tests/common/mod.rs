//! Shared test doubles.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ragbot_kb::{Chunk, EmbeddingProvider, KbError, KnowledgeBaseConfig};

pub const DIM: usize = 4;

/// An embedding provider whose vectors and failures are scripted.
///
/// A text's vector comes from the first rule whose keyword it contains;
/// texts matching no rule map to the last axis.
pub struct ScriptedProvider {
    rules: Vec<(String, Vec<f32>)>,
    calls: AtomicUsize,
    inputs: AtomicUsize,
    transient_failures: AtomicU32,
    unavailable: AtomicBool,
    reject_marker: Mutex<Option<String>>,
    flaky_marker: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            calls: AtomicUsize::new(0),
            inputs: AtomicUsize::new(0),
            transient_failures: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            reject_marker: Mutex::new(None),
            flaky_marker: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    pub fn with_rule(mut self, keyword: &str, vector: [f32; DIM]) -> Self {
        self.rules.push((keyword.to_string(), vector.to_vec()));
        self
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every call with a transient error until switched off.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject any request containing a text with `marker`.
    pub fn reject_containing(&self, marker: &str) {
        *self.reject_marker.lock().unwrap() = Some(marker.to_string());
    }

    /// Fail any request containing a text with `marker` with a transient
    /// error. `None` clears it.
    pub fn fail_containing(&self, marker: Option<&str>) {
        *self.flaky_marker.lock().unwrap() = marker.map(str::to_string);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Number of provider requests made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts successfully embedded.
    pub fn embedded_inputs(&self) -> usize {
        self.inputs.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        self.rules
            .iter()
            .find(|(keyword, _)| text.contains(keyword.as_str()))
            .map(|(_, vector)| vector.clone())
            .unwrap_or_else(|| {
                let mut fallback = vec![0.0; DIM];
                fallback[DIM - 1] = 1.0;
                fallback
            })
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn embed(&self, text: &str) -> ragbot_kb::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text]).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[&str]) -> ragbot_kb::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KbError::ProviderTransient {
                provider: "scripted".into(),
                message: "service unavailable".into(),
            });
        }
        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(KbError::ProviderTransient {
                provider: "scripted".into(),
                message: "rate limited".into(),
            });
        }
        let flaky = self.flaky_marker.lock().unwrap().clone();
        if let Some(flaky) = flaky {
            if texts.iter().any(|t| t.contains(&flaky)) {
                return Err(KbError::ProviderTransient {
                    provider: "scripted".into(),
                    message: "upstream timeout".into(),
                });
            }
        }
        let marker = self.reject_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if texts.iter().any(|t| t.contains(&marker)) {
                return Err(KbError::ProviderRejected {
                    provider: "scripted".into(),
                    message: "input rejected".into(),
                });
            }
        }

        self.inputs.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIM
    }
}

/// Defaults with a permissive threshold and small chunks.
pub fn test_config() -> KnowledgeBaseConfig {
    KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .similarity_threshold(0.5)
        .build()
        .unwrap()
}

pub fn chunk(document_id: &str, index: usize, text: &str) -> Chunk {
    Chunk::new(document_id, index, text, index * 100, 0)
}
