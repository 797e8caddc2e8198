//! End-to-end ingest and retrieval through `KnowledgeBase`.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{ScriptedProvider, test_config};
use ragbot_kb::{
    CacheBackend, CacheEntry, DocumentFormat, DocumentState, EmbeddingCache, FailureReason,
    IngestRequest, KbError, KnowledgeBase, KnowledgeBaseConfig, KnowledgeBaseStatus, QueryMode,
    RetrievalStatus,
};
use ragbot_telemetry::CapturedEvents;
use tempfile::TempDir;
use tracing::Level;

fn fruit_provider() -> Arc<ScriptedProvider> {
    Arc::new(
        ScriptedProvider::new()
            .with_rule("apple", [1.0, 0.0, 0.0, 0.0])
            .with_rule("banana", [0.0, 1.0, 0.0, 0.0])
            .with_rule("fruit", [0.6, 0.8, 0.0, 0.0]),
    )
}

fn knowledge_base(provider: &Arc<ScriptedProvider>, config: KnowledgeBaseConfig) -> KnowledgeBase {
    KnowledgeBase::builder().config(config).embedding_provider(provider.clone()).build().unwrap()
}

async fn fruit_knowledge_base(provider: &Arc<ScriptedProvider>) -> KnowledgeBase {
    let kb = knowledge_base(provider, test_config());
    kb.ingest("apples.txt", b"apples grow on trees", None).await;
    kb.ingest("bananas.txt", b"bananas are yellow", None).await;
    kb
}

#[tokio::test]
async fn reingesting_unchanged_content_makes_no_provider_calls() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());

    let first = kb.ingest("apples.txt", b"apples grow on trees", None).await;
    assert_eq!(first, DocumentState::Indexed { chunk_count: 1, warnings: 0 });
    assert_eq!(provider.calls(), 1);

    let second = kb.ingest("apples.txt", b"apples grow on trees", None).await;
    assert_eq!(second, first);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn editing_a_document_reembeds_only_changed_chunks() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());

    let original = "x".repeat(250);
    let state = kb.ingest("long.txt", original.as_bytes(), None).await;
    assert_eq!(state, DocumentState::Indexed { chunk_count: 3, warnings: 0 });
    assert_eq!(provider.embedded_inputs(), 3);

    let edited = format!("{}y", "x".repeat(249));
    let state = kb.ingest("long.txt", edited.as_bytes(), None).await;
    assert_eq!(state, DocumentState::Indexed { chunk_count: 3, warnings: 0 });
    assert_eq!(provider.embedded_inputs(), 4);
    assert_eq!(kb.stats().await.chunk_count, 3);
}

#[tokio::test]
async fn knowledge_base_only_on_empty_index_finds_nothing_without_embedding() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());

    let context = kb.query("which fruit is yellow?", QueryMode::KnowledgeBaseOnly).await.unwrap();

    assert_eq!(context.status, RetrievalStatus::NoRelevantDocuments);
    assert!(context.context_text.is_empty());
    assert!(context.citations.is_empty());
    assert!(!context.allows_general_knowledge());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn blank_query_on_empty_index_finds_nothing() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());

    let context = kb.query("   ", QueryMode::KnowledgeBaseOnly).await.unwrap();

    assert_eq!(context.status, RetrievalStatus::NoRelevantDocuments);
    assert!(!context.allows_general_knowledge());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let provider = fruit_provider();
    provider.fail_next(2);
    let kb = knowledge_base(&provider, test_config());

    let state = kb.ingest("apples.txt", b"apples grow on trees", None).await;

    assert_eq!(state, DocumentState::Indexed { chunk_count: 1, warnings: 0 });
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn citations_follow_descending_relevance() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;

    let context = kb.query("fruit", QueryMode::KnowledgeBaseOnly).await.unwrap();

    assert_eq!(context.status, RetrievalStatus::Found);
    assert_eq!(context.citations, vec!["bananas.txt", "apples.txt"]);
    assert_eq!(
        context.context_text,
        "[Source: bananas.txt]\nbananas are yellow\n\n[Source: apples.txt]\napples grow on trees"
    );
    assert!(context.results[0].score > context.results[1].score);
}

#[tokio::test]
async fn threshold_filters_weak_matches() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;

    let context =
        kb.answer_context("fruit", QueryMode::Hybrid, 3, 0.7).await.unwrap();
    assert_eq!(context.citations, vec!["bananas.txt"]);

    let context =
        kb.answer_context("something unrelated", QueryMode::Hybrid, 3, 0.5).await.unwrap();
    assert_eq!(context.status, RetrievalStatus::NoRelevantDocuments);
    assert!(context.allows_general_knowledge());
}

#[tokio::test]
async fn rejected_chunk_is_skipped_with_a_warning() {
    let events = CapturedEvents::new();
    let _guard = tracing::subscriber::set_default(events.subscriber());

    let provider = fruit_provider();
    provider.reject_containing("FORBIDDEN");
    let kb = knowledge_base(&provider, test_config());

    // Chunks cover 0..100, 90..190 and 180..229; only the middle one holds the marker.
    let text = format!("{}FORBIDDEN{}", "a".repeat(120), "b".repeat(100));
    let state = kb.ingest("mixed.txt", text.as_bytes(), None).await;

    assert_eq!(state, DocumentState::Indexed { chunk_count: 2, warnings: 1 });
    let skipped: Vec<_> = events
        .at_level(Level::WARN)
        .into_iter()
        .filter(|e| e.message.as_deref() == Some("skipping chunk"))
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].field("chunk_index"), Some(&serde_json::json!(1)));
    assert_eq!(skipped[0].field("document.id"), Some(&serde_json::json!("mixed.txt")));
}

#[tokio::test(start_paused = true)]
async fn unavailable_chunk_is_dropped_and_embedded_on_the_next_ingest() {
    let provider = fruit_provider();
    provider.fail_containing(Some("FLAKY"));
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .embedding_batch_size(1)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);

    // Only the middle chunk holds the marker.
    let text = format!("{}FLAKY{}", "a".repeat(120), "b".repeat(100));
    let state = kb.ingest("flaky.txt", text.as_bytes(), None).await;
    assert_eq!(state, DocumentState::Indexed { chunk_count: 2, warnings: 1 });
    assert_eq!(kb.stats().await.chunk_count, 2);
    assert_eq!(provider.embedded_inputs(), 2);

    provider.fail_containing(None);
    let state = kb.ingest("flaky.txt", text.as_bytes(), None).await;
    assert_eq!(state, DocumentState::Indexed { chunk_count: 3, warnings: 0 });
    assert_eq!(provider.embedded_inputs(), 3);
}

#[tokio::test]
async fn requests_never_exceed_the_batch_size() {
    let provider = fruit_provider();
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .embedding_batch_size(2)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);

    // Chunks start at 0, 90, 180, 270 and 360.
    let state = kb.ingest("long.txt", "x".repeat(430).as_bytes(), None).await;

    assert_eq!(state, DocumentState::Indexed { chunk_count: 5, warnings: 0 });
    assert_eq!(provider.calls(), 3);
    assert_eq!(provider.embedded_inputs(), 5);
}

async fn timed_ingest(max_concurrent_batches: usize) -> Duration {
    let provider = fruit_provider();
    provider.set_delay(Duration::from_secs(1));
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .embedding_batch_size(1)
        .max_concurrent_batches(max_concurrent_batches)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);

    let started = tokio::time::Instant::now();
    let state = kb.ingest("long.txt", "x".repeat(340).as_bytes(), None).await;
    assert_eq!(state, DocumentState::Indexed { chunk_count: 4, warnings: 0 });
    assert_eq!(provider.calls(), 4);
    started.elapsed()
}

#[tokio::test(start_paused = true)]
async fn batches_run_concurrently_up_to_the_limit() {
    assert!(timed_ingest(4).await < Duration::from_secs(2));
    assert!(timed_ingest(2).await >= Duration::from_secs(2));
    assert!(timed_ingest(1).await >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn failed_reingest_keeps_previous_version_searchable() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());
    kb.ingest("apples.txt", b"apples grow on trees", None).await;

    provider.set_unavailable(true);
    let state = kb.ingest("apples.txt", b"apples are now purple", None).await;
    assert!(matches!(state, DocumentState::Failed(FailureReason::EmbeddingUnavailable(_))));
    assert_eq!(kb.document_state("apples.txt").await, Some(state));

    provider.set_unavailable(false);
    let context = kb.query("apple", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.status, RetrievalStatus::Found);
    assert!(context.context_text.contains("apples grow on trees"));
}

#[tokio::test(start_paused = true)]
async fn slow_ingest_times_out_without_touching_the_index() {
    let provider = fruit_provider();
    provider.set_delay(Duration::from_secs(5));
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .ingest_timeout_secs(1)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);

    let state = kb.ingest("apples.txt", b"apples grow on trees", None).await;

    assert_eq!(state, DocumentState::Failed(FailureReason::TimedOut(1)));
    assert_eq!(kb.stats().await.chunk_count, 0);
}

#[tokio::test]
async fn query_embedding_failure_is_an_error() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;
    provider.reject_containing("FORBIDDEN");

    let err = kb.query("FORBIDDEN fruit", QueryMode::Hybrid).await.unwrap_err();
    assert!(matches!(err, KbError::InvalidInput(_)));
}

#[tokio::test]
async fn deleted_document_is_no_longer_retrieved() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;

    assert!(kb.delete("bananas.txt").await);
    let context = kb.query("banana", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.status, RetrievalStatus::NoRelevantDocuments);
    assert_eq!(kb.document_state("bananas.txt").await, None);

    assert!(!kb.delete("bananas.txt").await);
    assert_eq!(kb.stats().await.document_count, 1);
}

#[tokio::test]
async fn batch_failures_are_isolated() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());

    let reports = kb
        .ingest_batch(vec![
            IngestRequest::new("sheet.xlsx", vec![0u8; 8]),
            IngestRequest::new("broken.json", "{ oops"),
            IngestRequest::new("notes", "apples grow on trees").with_format(DocumentFormat::PlainText),
        ])
        .await;

    let ids: Vec<&str> = reports.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(ids, vec!["sheet.xlsx", "broken.json", "notes"]);
    assert_eq!(reports[0].state, DocumentState::Failed(FailureReason::UnsupportedFormat("xlsx".into())));
    assert!(matches!(reports[1].state, DocumentState::Failed(FailureReason::CorruptDocument(_))));
    assert_eq!(reports[2].state, DocumentState::Indexed { chunk_count: 1, warnings: 0 });

    let stats = kb.stats().await;
    assert_eq!((stats.document_count, stats.chunk_count), (3, 1));
    assert_eq!(stats.status, KnowledgeBaseStatus::Ready);
}

#[tokio::test]
async fn general_mode_skips_retrieval() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;
    let calls = provider.calls();

    let context = kb.query("fruit", QueryMode::General).await.unwrap();

    assert_eq!(context.status, RetrievalStatus::Skipped);
    assert!(context.citations.is_empty());
    assert_eq!(provider.calls(), calls);
}

#[tokio::test]
async fn context_stops_at_the_first_block_that_does_not_fit() {
    let provider = fruit_provider();
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .similarity_threshold(0.5)
        .max_context_length(50)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);
    kb.ingest("apples.txt", b"apples grow on trees", None).await;
    kb.ingest("bananas.txt", b"bananas are yellow", None).await;

    let context = kb.query("fruit", QueryMode::Hybrid).await.unwrap();

    assert_eq!(context.context_text, "[Source: bananas.txt]\nbananas are yellow");
    assert_eq!(context.citations, vec!["bananas.txt"]);
    assert_eq!(context.results.len(), 1);
}

#[tokio::test]
async fn nothing_fitting_the_context_limit_is_not_found() {
    let provider = fruit_provider();
    let config = KnowledgeBaseConfig::builder()
        .chunk_size(100)
        .chunk_overlap(10)
        .similarity_threshold(0.5)
        .max_context_length(10)
        .build()
        .unwrap();
    let kb = knowledge_base(&provider, config);
    kb.ingest("apples.txt", b"apples grow on trees", None).await;

    let context = kb.query("apple", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.status, RetrievalStatus::NoRelevantDocuments);
    assert!(context.citations.is_empty());
}

#[tokio::test]
async fn invalid_query_parameters_are_rejected() {
    let provider = fruit_provider();
    let kb = fruit_knowledge_base(&provider).await;

    let zero_k = kb.answer_context("fruit", QueryMode::Hybrid, 0, 0.5).await.unwrap_err();
    assert!(matches!(zero_k, KbError::InvalidInput(_)));

    let bad_threshold = kb.answer_context("fruit", QueryMode::Hybrid, 3, 1.5).await.unwrap_err();
    assert!(matches!(bad_threshold, KbError::InvalidInput(_)));

    let empty = kb.query("   ", QueryMode::KnowledgeBaseOnly).await.unwrap_err();
    assert!(matches!(empty, KbError::InvalidInput(_)));
}

#[tokio::test]
async fn stats_report_every_document_sorted() {
    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());
    assert_eq!(kb.stats().await.status, KnowledgeBaseStatus::Empty);

    kb.ingest("bananas.txt", b"bananas are yellow", None).await;
    kb.ingest("apples.md", b"# Apples\n\napples grow on trees", None).await;
    kb.ingest("broken.json", b"{", None).await;

    let stats = kb.stats().await;
    let ids: Vec<&str> = stats.documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["apples.md", "bananas.txt", "broken.json"]);
    assert_eq!(stats.documents[0].format, Some(DocumentFormat::Markdown));
    assert_eq!(stats.documents[1].chunk_count, 1);
    assert_eq!(stats.documents[2].chunk_count, 0);
    assert_eq!(stats.documents[2].state.label(), "failed");
}

#[tokio::test]
async fn reopening_restores_the_index_from_the_cache() {
    let dir = TempDir::new().unwrap();
    let config = || {
        KnowledgeBaseConfig::builder()
            .chunk_size(100)
            .chunk_overlap(10)
            .similarity_threshold(0.5)
            .embeddings_cache_dir(dir.path())
            .build()
            .unwrap()
    };

    {
        let provider = fruit_provider();
        let kb = KnowledgeBase::open(config(), provider.clone()).await.unwrap();
        kb.ingest("apples.txt", b"apples grow on trees", None).await;
        kb.ingest("bananas.txt", b"bananas are yellow", None).await;
    }

    let provider = fruit_provider();
    let kb = KnowledgeBase::open(config(), provider.clone()).await.unwrap();

    let stats = kb.stats().await;
    assert_eq!((stats.document_count, stats.chunk_count), (2, 2));
    assert_eq!(
        kb.document_state("apples.txt").await,
        Some(DocumentState::Indexed { chunk_count: 1, warnings: 0 })
    );

    let context = kb.query("fruit", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.citations, vec!["bananas.txt", "apples.txt"]);
    assert_eq!(provider.calls(), 1);

    kb.ingest("apples.txt", b"apples grow on trees", None).await;
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn sync_directory_mirrors_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("apples.txt"), "apples grow on trees").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub").join("bananas.md"), "bananas are yellow").unwrap();
    std::fs::write(dir.path().join("photo.png"), [0u8, 1, 2]).unwrap();

    let provider = fruit_provider();
    let kb = knowledge_base(&provider, test_config());
    kb.ingest("manual.txt", b"apples by hand", None).await;

    let report = kb.sync_directory(dir.path()).await.unwrap();
    let ingested: Vec<&str> = report.ingested.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(ingested, vec!["apples.txt", "sub/bananas.md"]);
    assert_eq!(report.ignored, vec!["photo.png"]);
    assert!(report.removed.is_empty());

    std::fs::remove_file(dir.path().join("apples.txt")).unwrap();
    let report = kb.sync_directory(dir.path()).await.unwrap();
    assert_eq!(report.removed, vec!["apples.txt"]);

    let ids: Vec<String> = kb.stats().await.documents.into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["manual.txt", "sub/bananas.md"]);
}

#[tokio::test]
async fn sync_after_reopening_removes_files_deleted_in_between() {
    let cache_dir = TempDir::new().unwrap();
    let knowledge_dir = TempDir::new().unwrap();
    std::fs::write(knowledge_dir.path().join("apples.txt"), "apples grow on trees").unwrap();
    std::fs::write(knowledge_dir.path().join("bananas.txt"), "bananas are yellow").unwrap();
    let config = || {
        KnowledgeBaseConfig::builder()
            .chunk_size(100)
            .chunk_overlap(10)
            .similarity_threshold(0.5)
            .embeddings_cache_dir(cache_dir.path())
            .build()
            .unwrap()
    };

    {
        let kb = KnowledgeBase::open(config(), fruit_provider()).await.unwrap();
        kb.ingest("manual.txt", b"apples by hand", None).await;
        let report = kb.sync_directory(knowledge_dir.path()).await.unwrap();
        assert_eq!(report.ingested.len(), 2);
    }

    std::fs::remove_file(knowledge_dir.path().join("apples.txt")).unwrap();
    let kb = KnowledgeBase::open(config(), fruit_provider()).await.unwrap();
    let report = kb.sync_directory(knowledge_dir.path()).await.unwrap();

    assert_eq!(report.removed, vec!["apples.txt"]);
    let ids: Vec<String> = kb.stats().await.documents.into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["bananas.txt", "manual.txt"]);
    let context = kb.query("apple", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.citations, vec!["manual.txt"]);

    // Nothing stale is left behind for a third run.
    drop(kb);
    let kb = KnowledgeBase::open(config(), fruit_provider()).await.unwrap();
    assert!(kb.sync_directory(knowledge_dir.path()).await.unwrap().removed.is_empty());
}

/// Keeps records in memory and answers listings slowly.
#[derive(Default)]
struct SlowListingBackend {
    records: Mutex<HashMap<String, Vec<CacheEntry>>>,
    listing_delay: Duration,
}

#[async_trait]
impl CacheBackend for SlowListingBackend {
    async fn read_document(&self, document_id: &str) -> ragbot_kb::Result<Option<Vec<CacheEntry>>> {
        Ok(self.records.lock().unwrap().get(document_id).cloned())
    }

    async fn write_document(&self, document_id: &str, entries: &[CacheEntry]) -> ragbot_kb::Result<()> {
        self.records.lock().unwrap().insert(document_id.to_string(), entries.to_vec());
        Ok(())
    }

    async fn remove_document(&self, document_id: &str) -> ragbot_kb::Result<()> {
        self.records.lock().unwrap().remove(document_id);
        Ok(())
    }

    async fn document_ids(&self) -> ragbot_kb::Result<Vec<String>> {
        tokio::time::sleep(self.listing_delay).await;
        let mut ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[tokio::test(start_paused = true)]
async fn rebuild_never_discards_a_concurrent_ingest() {
    let provider = fruit_provider();
    provider.set_delay(Duration::from_secs(1));
    let backend = SlowListingBackend { listing_delay: Duration::from_secs(2), ..Default::default() };
    let kb = KnowledgeBase::builder()
        .config(test_config())
        .embedding_provider(provider.clone())
        .cache(EmbeddingCache::with_backend(backend))
        .build()
        .unwrap();

    // The ingest commits while the rebuild is still listing the cache.
    let (state, rebuilt) =
        tokio::join!(kb.ingest("apples.txt", b"apples grow on trees", None), kb.rebuild_index());

    assert_eq!(state, DocumentState::Indexed { chunk_count: 1, warnings: 0 });
    rebuilt.unwrap();
    let stats = kb.stats().await;
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(stats.documents[0].chunk_count, 1);

    provider.set_delay(Duration::ZERO);
    let context = kb.query("apple", QueryMode::KnowledgeBaseOnly).await.unwrap();
    assert_eq!(context.citations, vec!["apples.txt"]);

    // The rebuilt index still agrees with the cache.
    assert_eq!(kb.rebuild_index().await.unwrap(), 1);
}
