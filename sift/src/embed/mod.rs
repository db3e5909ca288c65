//! Embedding pipeline.
//!
//! Given `(collection, text)`, produces a vector of the collection's
//! declared dimensionality through a three-tier cache (in-memory LRU,
//! persistent KV file, in-database table) and a provider registry.
//! Tiers are checked in order and promoted on hit; a miss in all three
//! dispatches to the provider and writes through to every tier.
//!
//! Identical in-flight requests (same cache key) are coalesced onto one
//! provider call. Provider failures retry with exponential backoff up to a
//! small cap; terminal failures land the document back on the embedding
//! queue, which is a table and therefore survives restarts.

mod cache;

pub use cache::{CacheKey, KvCache, MemoryCache};

use crate::broker::CancelToken;
use crate::error::{Error, Result};
use crate::store::{vector_from_bytes, vector_to_bytes, Collection, Store};
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use sift_embed::{EmbeddingProvider, ProviderKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

type Blake2b128 = Blake2b<U16>;

/// 128-bit blake2b digest of a text, hex-encoded. Identical digests under
/// the same (provider, model) must yield the same vector, which is what
/// makes the cache tiers sound.
pub fn text_digest(text: &str) -> String {
    let digest = Blake2b128::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The text a document is embedded from.
pub fn embedding_text(title: Option<&str>, content: &str) -> String {
    match title {
        Some(title) if !title.is_empty() => format!("{}\n\n{}", title, content),
        _ => content.to_string(),
    }
}

/// Which layer served a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    CacheMemory,
    CacheKv,
    CacheDb,
    Provider,
}

/// A produced query embedding plus provenance.
#[derive(Debug, Clone)]
pub struct EmbeddingOutcome {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
    pub processing_ms: u64,
}

/// Per-document result of a batch generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEmbedResult {
    pub document_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a batch generation run. Partial success is a valid result;
/// failed documents are re-queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success_count: usize,
    pub failed_count: usize,
    pub details: Vec<DocumentEmbedResult>,
}

/// Summary of a queue-draining run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOutcome {
    pub processed: usize,
    pub failed: usize,
    pub remaining: i64,
}

/// Progress callback for batch generation.
pub trait EmbedProgress: Send {
    /// Called after each chunk with (documents completed, total).
    fn on_chunk(&mut self, completed: usize, total: usize);
}

/// No-op progress reporter.
pub struct NoopProgress;

impl EmbedProgress for NoopProgress {
    fn on_chunk(&mut self, _completed: usize, _total: usize) {}
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tier-1 entry cap.
    pub memory_entries: usize,
    /// Optional tier-1 TTL.
    pub memory_ttl: Option<Duration>,
    /// Tier-2 cache file; `None` disables the KV tier.
    pub kv_path: Option<PathBuf>,
    /// Tier-2 byte cap.
    pub kv_max_bytes: u64,
    /// Tier-3 rows kept after a prune pass.
    pub db_cache_max_entries: usize,
    /// Budget for a single provider attempt.
    pub provider_timeout: Duration,
    /// Attempt cap for retryable provider errors.
    pub max_attempts: u32,
    /// Ceiling across loaded provider state plus the memory tier.
    pub memory_ceiling_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            memory_entries: 1000,
            memory_ttl: None,
            kv_path: None,
            kv_max_bytes: 50 * 1024 * 1024,
            db_cache_max_entries: 50_000,
            provider_timeout: Duration::from_secs(30),
            max_attempts: 3,
            memory_ceiling_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Observed state of a registered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub identifier: String,
    pub dimensions: usize,
    pub local: bool,
    pub memory_estimate: usize,
}

/// Cache hit rates per tier, over the pipeline's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHitRates {
    pub memory: f64,
    pub kv: f64,
    pub db: f64,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub providers: Vec<ProviderStatus>,
    pub memory_cache_entries: usize,
    pub memory_estimate_bytes: usize,
    pub kv_used_bytes: Option<u64>,
    pub hit_rates: CacheHitRates,
    pub requests: u64,
    pub provider_calls: u64,
    pub coalesced: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct PipelineStats {
    requests: AtomicU64,
    hits_memory: AtomicU64,
    hits_kv: AtomicU64,
    hits_db: AtomicU64,
    provider_calls: AtomicU64,
    coalesced: AtomicU64,
    db_writes: AtomicU64,
}

/// Whether a database-tier access needs the SQL gate or the caller already
/// holds it (ingest runs inside its own transaction bracket).
#[derive(Clone, Copy, PartialEq, Eq)]
enum DbAccess {
    Gated,
    CallerHolds,
}

/// The embedding pipeline.
pub struct Pipeline {
    store: Arc<Store>,
    gate: Arc<Mutex<()>>,
    providers: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
    /// Identifiers in least-recently-used-first order, for unloading.
    provider_recency: StdMutex<Vec<String>>,
    memory: MemoryCache,
    kv: Option<KvCache>,
    inflight: StdMutex<HashMap<CacheKey, Arc<Notify>>>,
    stats: PipelineStats,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(store: Arc<Store>, gate: Arc<Mutex<()>>, config: PipelineConfig) -> Result<Self> {
        let kv = match &config.kv_path {
            Some(path) => Some(KvCache::open(path, config.kv_max_bytes)?),
            None => None,
        };
        Ok(Pipeline {
            store,
            gate,
            providers: RwLock::new(HashMap::new()),
            provider_recency: StdMutex::new(Vec::new()),
            memory: MemoryCache::new(config.memory_entries, config.memory_ttl),
            kv,
            inflight: StdMutex::new(HashMap::new()),
            stats: PipelineStats::default(),
            config,
        })
    }

    /// Register a provider under its identifier. Last registration wins.
    pub fn register_provider(&self, provider: Arc<dyn EmbeddingProvider>) {
        let id = provider.identifier().to_string();
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), provider);
        self.touch_provider(&id);
    }

    fn touch_provider(&self, id: &str) {
        let mut recency = self
            .provider_recency
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        recency.retain(|existing| existing != id);
        recency.push(id.to_string());
    }

    /// Resolve the provider a collection is configured with, validating its
    /// declared dimensions against the collection's.
    pub fn provider_for(&self, collection: &Collection) -> Result<Arc<dyn EmbeddingProvider>> {
        let provider = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&collection.provider_id)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "no provider registered for '{}'",
                    collection.provider_id
                ))
            })?;
        if provider.dimensions() != collection.dimensions {
            return Err(Error::DimensionMismatch {
                expected: collection.dimensions,
                actual: provider.dimensions(),
            });
        }
        self.touch_provider(collection.provider_id.as_str());
        Ok(provider)
    }

    /// Eagerly initialize provider state.
    pub async fn preload(&self, provider_ids: &[String]) -> Result<()> {
        for id in provider_ids {
            let provider = self
                .providers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(id)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("no provider registered for '{}'", id))
                })?;
            provider.preload().await.map_err(Error::from)?;
            self.touch_provider(id);
        }
        self.enforce_memory_ceiling().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Query path
    // -------------------------------------------------------------------------

    /// Produce a query embedding, reporting which tier served it.
    pub async fn embed_query(&self, collection: &Collection, text: &str) -> Result<EmbeddingOutcome> {
        let started = Instant::now();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let digest = text_digest(text);
        let key = CacheKey::new(&collection.provider_id, &collection.model_id, &digest);

        loop {
            if let Some(outcome) = self.lookup_tiers(&key, DbAccess::Gated).await? {
                return Ok(EmbeddingOutcome {
                    vector: outcome.0,
                    source: outcome.1,
                    processing_ms: started.elapsed().as_millis() as u64,
                });
            }

            // Miss in all tiers. Either become the leader for this key or
            // wait for the in-flight leader and re-check the tiers.
            let waiter = {
                let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                match inflight.get(&key) {
                    Some(notify) => Some(notify.clone()),
                    None => {
                        inflight.insert(key.clone(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match waiter {
                None => {
                    let result = self.generate_and_store(collection, text, &key).await;
                    let notify = {
                        let mut inflight =
                            self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                        inflight.remove(&key)
                    };
                    if let Some(notify) = notify {
                        notify.notify_waiters();
                    }
                    let vector = result?;
                    return Ok(EmbeddingOutcome {
                        vector,
                        source: EmbeddingSource::Provider,
                        processing_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Some(notify) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    // Bounded wait; if the leader vanished (or failed before
                    // we subscribed) the next loop iteration takes over.
                    let _ = tokio::time::timeout(
                        self.config.provider_timeout,
                        notify.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Attempt a synchronous embedding during ingest, under the batch's
    /// latency budget. Returns `None` when the document should be queued
    /// instead: remote-only provider, budget exceeded, or provider failure.
    /// The caller holds the SQL gate, so database-tier access is direct.
    pub(crate) async fn try_embed_within(
        &self,
        collection: &Collection,
        text: &str,
        budget: Duration,
    ) -> Option<Vec<f32>> {
        let digest = text_digest(text);
        let key = CacheKey::new(&collection.provider_id, &collection.model_id, &digest);

        match self.lookup_tiers(&key, DbAccess::CallerHolds).await {
            Ok(Some((vector, _))) => return Some(vector),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("cache lookup failed during ingest: {}", e);
                return None;
            }
        }

        let provider = match self.provider_for(collection) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!("provider unavailable during ingest: {}", e);
                return None;
            }
        };
        if provider.kind() != ProviderKind::Local {
            return None;
        }

        // One attempt only; a slow provider must not stall the batch.
        self.stats.provider_calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(budget, provider.embed_one(text)).await {
            Ok(Ok(vector)) if vector.len() == collection.dimensions => {
                if let Err(e) = self
                    .write_through(&key, &vector, DbAccess::CallerHolds)
                    .await
                {
                    tracing::warn!("cache write-through failed during ingest: {}", e);
                }
                Some(vector)
            }
            Ok(Ok(vector)) => {
                tracing::warn!(
                    "provider returned {} dimensions, expected {}; queueing document",
                    vector.len(),
                    collection.dimensions
                );
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("provider failed during ingest, queueing document: {}", e);
                None
            }
            Err(_) => {
                tracing::debug!("embedding budget exceeded during ingest, queueing document");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Batch path
    // -------------------------------------------------------------------------

    /// Generate embeddings for existing documents in chunks sized to the
    /// collection's `batch_size`, yielding between chunks so concurrent
    /// queries are not starved.
    pub async fn batch_generate(
        &self,
        collection: &Collection,
        document_ids: &[String],
        progress: &mut dyn EmbedProgress,
        cancel: &CancelToken,
    ) -> Result<BatchOutcome> {
        let provider = self.provider_for(collection)?;
        let total = document_ids.len();
        let mut details = Vec::with_capacity(total);
        let mut completed = 0usize;

        for chunk in document_ids.chunks(collection.batch_size.max(1)) {
            cancel.check()?;

            // Resolve documents and split into cache hits and provider work.
            let mut pending: Vec<(String, i64, String, CacheKey)> = Vec::new();
            {
                let _guard = self.gate.lock().await;
                for id in chunk {
                    match self.store.get_document(&collection.name, id).await {
                        Ok(doc) => {
                            let text = embedding_text(doc.title.as_deref(), &doc.content);
                            let digest = text_digest(&text);
                            let key = CacheKey::new(
                                &collection.provider_id,
                                &collection.model_id,
                                &digest,
                            );
                            pending.push((id.clone(), doc.rowid, text, key));
                        }
                        Err(_) => {
                            details.push(DocumentEmbedResult {
                                document_id: id.clone(),
                                ok: false,
                                error: Some("document not found".to_string()),
                            });
                        }
                    }
                }
            }

            let mut resolved: Vec<(String, i64, CacheKey, Vec<f32>)> = Vec::new();
            let mut misses: Vec<(String, i64, String, CacheKey)> = Vec::new();
            for (id, rowid, text, key) in pending {
                match self.lookup_tiers(&key, DbAccess::Gated).await? {
                    Some((vector, _)) => resolved.push((id, rowid, key, vector)),
                    None => misses.push((id, rowid, text, key)),
                }
            }

            if !misses.is_empty() {
                let texts: Vec<String> = misses.iter().map(|(_, _, text, _)| text.clone()).collect();
                match self.call_provider_batch(&provider, &texts).await {
                    Ok(vectors) => {
                        for ((id, rowid, _, key), vector) in misses.into_iter().zip(vectors) {
                            self.write_through(&key, &vector, DbAccess::Gated).await?;
                            resolved.push((id, rowid, key, vector));
                        }
                    }
                    Err(e) => {
                        // Whole chunk failed: re-queue every miss and record
                        // the failure per document.
                        let message = e.to_string();
                        let _guard = self.gate.lock().await;
                        for (id, _, text, _) in &misses {
                            self.store
                                .enqueue_embedding(id, &collection.name, &text_digest(text))
                                .await?;
                            details.push(DocumentEmbedResult {
                                document_id: id.clone(),
                                ok: false,
                                error: Some(message.clone()),
                            });
                        }
                    }
                }
            }

            if !resolved.is_empty() {
                let _guard = self.gate.lock().await;
                self.store.begin().await?;
                let mut write_error = None;
                for (id, rowid, _, vector) in &resolved {
                    if let Err(e) = self.store.insert_vector_row(*rowid, vector).await {
                        write_error = Some((id.clone(), e));
                        break;
                    }
                }
                match write_error {
                    None => {
                        self.store.commit().await?;
                        for (id, _, _, _) in resolved {
                            details.push(DocumentEmbedResult {
                                document_id: id,
                                ok: true,
                                error: None,
                            });
                        }
                    }
                    Some((id, e)) => {
                        self.store.rollback().await?;
                        let message = e.to_string();
                        tracing::warn!("vector write failed for {}: {}", id, message);
                        for (id, _, _, _) in resolved {
                            details.push(DocumentEmbedResult {
                                document_id: id,
                                ok: false,
                                error: Some(message.clone()),
                            });
                        }
                    }
                }
            }

            completed = (completed + chunk.len()).min(total);
            progress.on_chunk(completed, total);
            self.enforce_memory_ceiling().await;
            tokio::task::yield_now().await;
        }

        let success_count = details.iter().filter(|d| d.ok).count();
        Ok(BatchOutcome {
            success_count,
            failed_count: details.len() - success_count,
            details,
        })
    }

    /// Drain up to `limit` queue entries, oldest first. Entries whose
    /// document already has a vector (or no longer exists) are dropped;
    /// provider failures leave the entry in place for a later pass.
    pub async fn process_queue(&self, limit: usize, cancel: &CancelToken) -> Result<QueueOutcome> {
        let entries = {
            let _guard = self.gate.lock().await;
            self.store.dequeue_batch(limit).await?
        };

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut collections: HashMap<String, Collection> = HashMap::new();

        for entry in entries {
            cancel.check()?;

            let collection = match collections.get(&entry.collection) {
                Some(collection) => collection.clone(),
                None => {
                    let _guard = self.gate.lock().await;
                    match self.store.get_collection(&entry.collection).await {
                        Ok(collection) => {
                            collections.insert(entry.collection.clone(), collection.clone());
                            collection
                        }
                        Err(_) => {
                            // Collection is gone; the entry is garbage.
                            self.store.remove_queue_entry(entry.id).await?;
                            continue;
                        }
                    }
                }
            };

            let doc = {
                let _guard = self.gate.lock().await;
                match self.store.get_document(&entry.collection, &entry.document_id).await {
                    Ok(doc) => {
                        if self.store.has_vector(doc.rowid).await? {
                            self.store.remove_queue_entry(entry.id).await?;
                            processed += 1;
                            continue;
                        }
                        doc
                    }
                    Err(_) => {
                        self.store.remove_queue_entry(entry.id).await?;
                        continue;
                    }
                }
            };

            let text = embedding_text(doc.title.as_deref(), &doc.content);
            match self.embed_query(&collection, &text).await {
                Ok(outcome) => {
                    let _guard = self.gate.lock().await;
                    self.store.insert_vector_row(doc.rowid, &outcome.vector).await?;
                    self.store.remove_queue_entry(entry.id).await?;
                    processed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "queued embedding failed for {}/{}: {}",
                        entry.collection,
                        entry.document_id,
                        e
                    );
                    failed += 1;
                }
            }
        }

        let remaining = {
            let _guard = self.gate.lock().await;
            self.store.queue_len().await?
        };

        Ok(QueueOutcome {
            processed,
            failed,
            remaining,
        })
    }

    // -------------------------------------------------------------------------
    // Status & memory
    // -------------------------------------------------------------------------

    /// Snapshot of providers, cache occupancy, and hit rates.
    pub fn status(&self) -> PipelineStatus {
        let providers: Vec<ProviderStatus> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| ProviderStatus {
                identifier: p.identifier().to_string(),
                dimensions: p.dimensions(),
                local: p.kind() == ProviderKind::Local,
                memory_estimate: p.memory_estimate(),
            })
            .collect();

        let requests = self.stats.requests.load(Ordering::Relaxed);
        let rate = |hits: u64| {
            if requests == 0 {
                0.0
            } else {
                hits as f64 / requests as f64
            }
        };

        let provider_bytes: usize = providers.iter().map(|p| p.memory_estimate).sum();

        PipelineStatus {
            providers,
            memory_cache_entries: self.memory.len(),
            memory_estimate_bytes: provider_bytes + self.memory.approx_bytes(),
            kv_used_bytes: self.kv.as_ref().map(|kv| kv.used_bytes()),
            hit_rates: CacheHitRates {
                memory: rate(self.stats.hits_memory.load(Ordering::Relaxed)),
                kv: rate(self.stats.hits_kv.load(Ordering::Relaxed)),
                db: rate(self.stats.hits_db.load(Ordering::Relaxed)),
            },
            requests,
            provider_calls: self.stats.provider_calls.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            in_flight: self
                .inflight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }

    /// Keep loaded provider state plus the memory tier under the ceiling:
    /// least-recently-used provider first, then LRU cache entries.
    async fn enforce_memory_ceiling(&self) {
        let usage = |providers: &HashMap<String, Arc<dyn EmbeddingProvider>>| {
            providers
                .values()
                .map(|p| p.memory_estimate())
                .sum::<usize>()
                + self.memory.approx_bytes()
        };

        let over = {
            let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
            usage(&providers) > self.config.memory_ceiling_bytes
        };
        if !over {
            return;
        }

        let order: Vec<String> = {
            self.provider_recency
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        for id in order {
            let still_over = {
                let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
                usage(&providers) > self.config.memory_ceiling_bytes
            };
            if !still_over {
                return;
            }
            let provider = self
                .providers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&id)
                .cloned();
            if let Some(provider) = provider {
                if provider.memory_estimate() > 0 {
                    tracing::info!("unloading provider '{}' to stay under memory ceiling", id);
                    provider.unload().await;
                }
            }
        }

        loop {
            let still_over = {
                let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
                usage(&providers) > self.config.memory_ceiling_bytes
            };
            if !still_over || !self.memory.evict_one() {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Check the tiers in order, promoting hits upward.
    async fn lookup_tiers(
        &self,
        key: &CacheKey,
        db_access: DbAccess,
    ) -> Result<Option<(Vec<f32>, EmbeddingSource)>> {
        if let Some(vector) = self.memory.get(key) {
            self.stats.hits_memory.fetch_add(1, Ordering::Relaxed);
            return Ok(Some((vector, EmbeddingSource::CacheMemory)));
        }

        if let Some(kv) = &self.kv {
            if let Some(bytes) = kv.get(key)? {
                let vector = vector_from_bytes(&bytes)?;
                self.memory.put(key.clone(), vector.clone());
                self.stats.hits_kv.fetch_add(1, Ordering::Relaxed);
                return Ok(Some((vector, EmbeddingSource::CacheKv)));
            }
        }

        let from_db = match db_access {
            DbAccess::Gated => {
                let _guard = self.gate.lock().await;
                self.store
                    .cache_get(&key.provider_id, &key.model_id, &key.text_digest)
                    .await?
            }
            DbAccess::CallerHolds => {
                self.store
                    .cache_get(&key.provider_id, &key.model_id, &key.text_digest)
                    .await?
            }
        };

        if let Some(vector) = from_db {
            if let Some(kv) = &self.kv {
                kv.put(key, &vector_to_bytes(&vector))?;
            }
            self.memory.put(key.clone(), vector.clone());
            self.stats.hits_db.fetch_add(1, Ordering::Relaxed);
            return Ok(Some((vector, EmbeddingSource::CacheDb)));
        }

        Ok(None)
    }

    /// Write a fresh vector through to every tier and prune the database
    /// tier periodically.
    async fn write_through(
        &self,
        key: &CacheKey,
        vector: &[f32],
        db_access: DbAccess,
    ) -> Result<()> {
        self.memory.put(key.clone(), vector.to_vec());
        if let Some(kv) = &self.kv {
            kv.put(key, &vector_to_bytes(vector))?;
        }

        let writes = self.stats.db_writes.fetch_add(1, Ordering::Relaxed) + 1;
        match db_access {
            DbAccess::Gated => {
                let _guard = self.gate.lock().await;
                self.store
                    .cache_put(&key.provider_id, &key.model_id, &key.text_digest, vector)
                    .await?;
                if writes % 256 == 0 {
                    self.store.cache_prune(self.config.db_cache_max_entries).await?;
                }
            }
            DbAccess::CallerHolds => {
                self.store
                    .cache_put(&key.provider_id, &key.model_id, &key.text_digest, vector)
                    .await?;
            }
        }
        Ok(())
    }

    /// Leader path: call the provider (with retries), validate, write
    /// through all tiers.
    async fn generate_and_store(
        &self,
        collection: &Collection,
        text: &str,
        key: &CacheKey,
    ) -> Result<Vec<f32>> {
        let provider = self.provider_for(collection)?;
        let vector = self.call_provider_one(&provider, text).await?;
        if vector.len() != collection.dimensions {
            return Err(Error::DimensionMismatch {
                expected: collection.dimensions,
                actual: vector.len(),
            });
        }
        self.write_through(key, &vector, DbAccess::Gated).await?;
        self.enforce_memory_ceiling().await;
        Ok(vector)
    }

    async fn call_provider_one(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        text: &str,
    ) -> Result<Vec<f32>> {
        let mut attempt = 1u32;
        loop {
            self.stats.provider_calls.fetch_add(1, Ordering::Relaxed);
            let error = match tokio::time::timeout(
                self.config.provider_timeout,
                provider.embed_one(text),
            )
            .await
            {
                Ok(Ok(vector)) => return Ok(vector),
                Ok(Err(e)) => Error::from(e),
                Err(_) => Error::ProviderTimeout {
                    budget_ms: self.config.provider_timeout.as_millis() as u64,
                },
            };

            if attempt >= self.config.max_attempts || !error.retryable() {
                return Err(error);
            }
            tokio::time::sleep(retry_delay(&error, attempt)).await;
            attempt += 1;
        }
    }

    async fn call_provider_batch(
        &self,
        provider: &Arc<dyn EmbeddingProvider>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 1u32;
        loop {
            self.stats.provider_calls.fetch_add(1, Ordering::Relaxed);
            let error = match tokio::time::timeout(
                self.config.provider_timeout,
                provider.embed_batch(texts),
            )
            .await
            {
                Ok(Ok(vectors)) => {
                    if vectors.len() != texts.len() {
                        return Err(Error::Provider {
                            message: format!(
                                "provider returned {} vectors for {} texts",
                                vectors.len(),
                                texts.len()
                            ),
                            retryable: false,
                            retry_after_ms: None,
                        });
                    }
                    return Ok(vectors);
                }
                Ok(Err(e)) => Error::from(e),
                Err(_) => Error::ProviderTimeout {
                    budget_ms: self.config.provider_timeout.as_millis() as u64,
                },
            };

            if attempt >= self.config.max_attempts || !error.retryable() {
                return Err(error);
            }
            tokio::time::sleep(retry_delay(&error, attempt)).await;
            attempt += 1;
        }
    }
}

/// Exponential backoff honoring a provider's retry-after signal.
fn retry_delay(error: &Error, attempt: u32) -> Duration {
    if let Error::Provider {
        retry_after_ms: Some(ms),
        ..
    } = error
    {
        return Duration::from_millis(*ms);
    }
    Duration::from_millis(250) * 2u32.saturating_pow(attempt - 1)
}
