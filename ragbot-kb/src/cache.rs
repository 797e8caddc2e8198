//! Embedding cache.
//!
//! Vectors are keyed by `(document_id, chunk_index, content_hash)`, so an
//! edited chunk never reuses a stale vector. [`EmbeddingCache`] keeps a
//! recency-ordered memory layer over an optional durable [`CacheBackend`].
//! Anything unreadable in the backend is treated as a miss.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::document::{Chunk, content_hash};
use crate::error::{KbError, Result};

/// Identity of a cached vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// The owning document.
    pub document_id: String,
    /// Position of the chunk in the document.
    pub chunk_index: usize,
    /// SHA-256 of the chunk text.
    pub content_hash: String,
}

impl CacheKey {
    /// The key addressing `chunk`.
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.index,
            content_hash: chunk.content_hash.clone(),
        }
    }
}

/// A chunk with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The embedded chunk.
    pub chunk: Chunk,
    /// Its vector.
    pub vector: Vec<f32>,
}

impl CacheEntry {
    /// The key addressing this entry.
    pub fn key(&self) -> CacheKey {
        CacheKey::for_chunk(&self.chunk)
    }

    fn defect(&self) -> Option<&'static str> {
        if content_hash(&self.chunk.text) != self.chunk.content_hash {
            Some("stored hash does not match stored text")
        } else if self.vector.is_empty() {
            Some("empty vector")
        } else if self.vector.iter().any(|v| !v.is_finite()) {
            Some("non-finite vector component")
        } else {
            None
        }
    }
}

/// Durable storage for per-document cache records.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// All entries stored for a document, or `None` if nothing is stored.
    ///
    /// Returns [`KbError::CacheCorrupt`] if the record cannot be decoded.
    async fn read_document(&self, document_id: &str) -> Result<Option<Vec<CacheEntry>>>;

    /// Replace the stored record of a document.
    async fn write_document(&self, document_id: &str, entries: &[CacheEntry]) -> Result<()>;

    /// Drop a document's record. Missing records are not an error.
    async fn remove_document(&self, document_id: &str) -> Result<()>;

    /// Identities of every readable stored document.
    async fn document_ids(&self) -> Result<Vec<String>>;

    /// Record whether a document was added by a directory sync.
    ///
    /// Backends without durable storage may ignore this.
    async fn set_synced(&self, _document_id: &str, _synced: bool) -> Result<()> {
        Ok(())
    }

    /// Identities recorded by [`set_synced`](CacheBackend::set_synced), sorted.
    async fn synced_ids(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

const SYNC_MANIFEST: &str = "synced.manifest";

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    document_id: String,
    entries: Vec<CacheEntry>,
}

/// One JSON file per document under a root directory.
///
/// File names are the SHA-256 of the document id, so arbitrary ids (paths,
/// URLs) map to safe names. Writes go to a temporary file that is then
/// renamed over the target, so readers never observe a torn record.
#[derive(Debug, Clone)]
pub struct FileCacheBackend {
    root: PathBuf,
}

impl FileCacheBackend {
    /// Create a backend rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The file holding `document_id`'s record.
    pub fn path_for(&self, document_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        self.root.join(format!("{:x}.json", hasher.finalize()))
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }

    async fn read_record(&self, path: &Path) -> Result<Option<CacheRecord>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| KbError::CacheCorrupt {
            document_id: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    async fn read_document(&self, document_id: &str) -> Result<Option<Vec<CacheEntry>>> {
        let path = self.path_for(document_id);
        let record = self.read_record(&path).await.map_err(|e| match e {
            KbError::CacheCorrupt { message, .. } => {
                KbError::CacheCorrupt { document_id: document_id.to_string(), message }
            }
            other => other,
        })?;
        match record {
            None => Ok(None),
            Some(record) if record.document_id != document_id => Err(KbError::CacheCorrupt {
                document_id: document_id.to_string(),
                message: format!("record belongs to '{}'", record.document_id),
            }),
            Some(record) => Ok(Some(record.entries)),
        }
    }

    async fn write_document(&self, document_id: &str, entries: &[CacheEntry]) -> Result<()> {
        let record = CacheRecord { document_id: document_id.to_string(), entries: entries.to_vec() };
        let json = serde_json::to_vec(&record).map_err(|e| KbError::CacheCorrupt {
            document_id: document_id.to_string(),
            message: format!("failed to serialize: {e}"),
        })?;
        self.write_atomic(&self.path_for(document_id), json).await
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(document_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn document_ids(&self) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(record)) => ids.push(record.document_id),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable cache file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn set_synced(&self, document_id: &str, synced: bool) -> Result<()> {
        let mut ids: BTreeSet<String> = self.synced_ids().await?.into_iter().collect();
        let changed =
            if synced { ids.insert(document_id.to_string()) } else { ids.remove(document_id) };
        if !changed {
            return Ok(());
        }
        let json = serde_json::to_vec(&ids).map_err(|e| KbError::CacheCorrupt {
            document_id: document_id.to_string(),
            message: format!("failed to serialize sync manifest: {e}"),
        })?;
        self.write_atomic(&self.root.join(SYNC_MANIFEST), json).await
    }

    async fn synced_ids(&self) -> Result<Vec<String>> {
        let path = self.root.join(SYNC_MANIFEST);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<BTreeSet<String>>(&bytes) {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable sync manifest");
                Ok(Vec::new())
            }
        }
    }
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Records or entries discarded as unreadable.
    pub corrupt: u64,
    /// Entries dropped from memory by the capacity limit.
    pub evictions: u64,
    /// Entries currently held in memory.
    pub len: usize,
}

#[derive(Default)]
struct CacheState {
    // Least recently used first.
    entries: IndexMap<CacheKey, CacheEntry>,
    // Documents whose backend record is fully present in `entries`.
    hydrated: HashSet<String>,
    stats: CacheStats,
}

/// Memory-first embedding cache with optional write-through persistence.
///
/// # Example
///
/// ```rust,ignore
/// use ragbot_kb::{CacheKey, EmbeddingCache, FileCacheBackend};
///
/// let cache = EmbeddingCache::with_backend(FileCacheBackend::new("./embeddings_cache"));
/// if let Some(vector) = cache.get(&CacheKey::for_chunk(&chunk)).await {
///     // reuse
/// }
/// ```
pub struct EmbeddingCache {
    state: Mutex<CacheState>,
    backend: Option<Arc<dyn CacheBackend>>,
    capacity: Option<usize>,
}

impl EmbeddingCache {
    /// A memory-only cache.
    pub fn in_memory() -> Self {
        Self { state: Mutex::new(CacheState::default()), backend: None, capacity: None }
    }

    /// A cache persisting through `backend`.
    pub fn with_backend(backend: impl CacheBackend + 'static) -> Self {
        Self::with_shared_backend(Arc::new(backend))
    }

    /// A cache persisting through an already shared backend.
    pub fn with_shared_backend(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend: Some(backend), ..Self::in_memory() }
    }

    /// Limit the memory layer to `capacity` entries (`None` = unbounded).
    pub fn with_capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Whether entries survive a restart.
    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    /// Look up a vector. Never fails: anything unusable is a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<f32>> {
        let mut state = self.state.lock().await;

        if !state.entries.contains_key(key) && !state.hydrated.contains(&key.document_id) {
            self.hydrate(&mut state, &key.document_id).await;
        }

        match state.entries.shift_remove(key) {
            Some(entry) => {
                state.stats.hits += 1;
                let vector = entry.vector.clone();
                state.entries.insert(key.clone(), entry);
                Some(vector)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Store one vector, writing the document's record through.
    pub async fn put(&self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        let entry = CacheEntry { chunk, vector };
        let document_id = entry.chunk.document_id.clone();
        let mut state = self.state.lock().await;

        if let Some(backend) = &self.backend {
            let mut stored = match backend.read_document(&document_id).await {
                Ok(stored) => stored.unwrap_or_default(),
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "discarding unreadable cache record");
                    state.stats.corrupt += 1;
                    Vec::new()
                }
            };
            stored.retain(|existing| existing.chunk.index != entry.chunk.index);
            stored.push(entry.clone());
            stored.sort_by_key(|e| e.chunk.index);
            backend.write_document(&document_id, &stored).await?;
        }

        state.entries.retain(|key, _| {
            !(key.document_id == document_id && key.chunk_index == entry.chunk.index)
        });
        self.insert(&mut state, entry);
        Ok(())
    }

    /// Replace everything cached for `document_id` with `entries`.
    pub async fn put_document(&self, document_id: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(backend) = &self.backend {
            backend.write_document(document_id, &entries).await?;
        }

        state.entries.retain(|key, _| key.document_id != document_id);
        state.hydrated.insert(document_id.to_string());
        for entry in entries {
            self.insert(&mut state, entry);
        }
        debug!(document_id, len = state.entries.len(), "cache document replaced");
        Ok(())
    }

    /// Forget everything cached for `document_id`.
    pub async fn invalidate(&self, document_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.retain(|key, _| key.document_id != document_id);
        state.hydrated.remove(document_id);
        if let Some(backend) = &self.backend {
            backend.remove_document(document_id).await?;
            backend.set_synced(document_id, false).await?;
        }
        Ok(())
    }

    /// Persist whether `document_id` came from a directory sync.
    pub async fn set_synced(&self, document_id: &str, synced: bool) -> Result<()> {
        let _state = self.state.lock().await;
        match &self.backend {
            Some(backend) => backend.set_synced(document_id, synced).await,
            None => Ok(()),
        }
    }

    /// Documents persisted as coming from a directory sync.
    pub async fn synced_documents(&self) -> Result<Vec<String>> {
        let _state = self.state.lock().await;
        match &self.backend {
            Some(backend) => backend.synced_ids().await,
            None => Ok(Vec::new()),
        }
    }

    /// Every valid entry, ordered by document id then chunk index.
    ///
    /// Reads the whole backend; used to rebuild an index after restart.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut state = self.state.lock().await;
        let mut documents: BTreeMap<String, BTreeMap<usize, CacheEntry>> = BTreeMap::new();

        if let Some(backend) = &self.backend {
            for document_id in backend.document_ids().await? {
                let Some(stored) = self.read_valid(&mut state, &document_id).await else {
                    continue;
                };
                let chunks = documents.entry(document_id).or_default();
                for entry in stored {
                    chunks.insert(entry.chunk.index, entry);
                }
            }
        }

        for entry in state.entries.values() {
            documents
                .entry(entry.chunk.document_id.clone())
                .or_default()
                .entry(entry.chunk.index)
                .or_insert_with(|| entry.clone());
        }

        Ok(documents.into_values().flat_map(BTreeMap::into_values).collect())
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats { len: state.entries.len(), ..state.stats }
    }

    async fn hydrate(&self, state: &mut CacheState, document_id: &str) {
        if self.backend.is_none() {
            return;
        }
        // Marked first so an eviction during hydration clears the mark again.
        state.hydrated.insert(document_id.to_string());
        if let Some(stored) = self.read_valid(state, document_id).await {
            debug!(document_id, entries = stored.len(), "hydrating cache from backend");
            for entry in stored {
                if !state.entries.contains_key(&entry.key()) {
                    self.insert(state, entry);
                }
            }
        }
    }

    async fn read_valid(&self, state: &mut CacheState, document_id: &str) -> Option<Vec<CacheEntry>> {
        let backend = self.backend.as_ref()?;
        let stored = match backend.read_document(document_id).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(document_id, error = %e, "ignoring unreadable cache record");
                state.stats.corrupt += 1;
                return None;
            }
        };

        let mut valid = Vec::with_capacity(stored.len());
        for entry in stored {
            if entry.chunk.document_id != document_id {
                warn!(document_id, "ignoring cache entry filed under another document");
                state.stats.corrupt += 1;
            } else if let Some(defect) = entry.defect() {
                warn!(document_id, chunk_index = entry.chunk.index, defect, "ignoring corrupt cache entry");
                state.stats.corrupt += 1;
            } else {
                valid.push(entry);
            }
        }
        Some(valid)
    }

    fn insert(&self, state: &mut CacheState, entry: CacheEntry) {
        state.entries.shift_remove(&entry.key());
        state.entries.insert(entry.key(), entry);

        let Some(capacity) = self.capacity else {
            return;
        };
        while state.entries.len() > capacity {
            let Some((key, _)) = state.entries.shift_remove_index(0) else {
                break;
            };
            state.stats.evictions += 1;
            state.hydrated.remove(&key.document_id);
        }
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("persistent", &self.backend.is_some())
            .field("capacity", &self.capacity)
            .finish()
    }
}
