//! Request broker.
//!
//! The broker exposes the engine to foreground callers while everything
//! stateful (store, pipeline, search, ingest) runs behind it. Requests are
//! typed [`MethodCall`] values with monotonically increasing ids; the
//! dispatcher enforces an in-flight cap (excess requests queue in arrival
//! order, overflow fails fast with `Overloaded`), per-request timeouts, and
//! cooperative cancellation.
//!
//! A `begin` bracket takes exclusive ownership of the SQL gate until its
//! `commit`/`rollback`; only requests presenting the bracket's token run
//! inside it, everything else waits. That keeps the transaction and its
//! statements on the one database handle, which is the whole point.
//!
//! Cancellation is checkpoint-based: between statements, documents, and
//! chunks. A statement already running on the engine cannot be interrupted
//! mid-flight; on timeout the caller gets its error immediately and the
//! handler unwinds at its next checkpoint.

pub mod protocol;

use crate::embed::{NoopProgress, Pipeline, PipelineConfig};
use crate::error::{Error, Result};
use crate::ingest::{DocumentInput, InsertOptions, Ingestor};
use crate::search::{SearchRequest, SearchResponse, Searcher};
use crate::store::{CollectionConfig, PragmaConfig, Statement, Store, SCHEMA_VERSION};
use protocol::{
    CollectionStatus, EmbeddingResponse, MethodCall, Response, StatsInfo, VersionInfo,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock, Semaphore};

/// Cooperative cancellation token, checked at checkpoints.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation. Honored when the work reaches its next
    /// checkpoint.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Checkpoint: fail with `Cancelled` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled("cancelled at checkpoint".to_string()))
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Concurrent in-flight requests.
    pub max_in_flight: usize,
    /// Requests waiting beyond the in-flight cap; overflow fails fast.
    pub max_queued: usize,
    /// Applied when a request carries no explicit timeout.
    pub default_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            max_in_flight: 10,
            max_queued: 100,
            default_timeout: Duration::from_secs(30),
            pipeline: PipelineConfig::default(),
        }
    }
}

struct Envelope {
    id: u64,
    call: MethodCall,
    timeout: Duration,
    cancel: CancelToken,
    responder: oneshot::Sender<Result<Response>>,
}

struct ActiveTx {
    token: u64,
    _guard: OwnedMutexGuard<()>,
}

/// Everything that exists only while a database is open. Field order is
/// teardown order: dependents drop before their dependencies (searcher and
/// ingestor before the pipeline, the pipeline before the store).
struct EngineState {
    searcher: Searcher,
    ingestor: Ingestor,
    pipeline: Arc<Pipeline>,
    store: Arc<Store>,
    gate: Arc<Mutex<()>>,
    active_tx: StdMutex<Option<ActiveTx>>,
    path: PathBuf,
    pragmas: PragmaConfig,
}

struct Engine {
    state: RwLock<Option<EngineState>>,
    providers: StdMutex<Vec<Arc<dyn sift_embed::EmbeddingProvider>>>,
    pipeline_config: PipelineConfig,
    op_counts: StdMutex<HashMap<String, u64>>,
}

/// Acquire the SQL gate, aborting promptly if the request is cancelled
/// while waiting (e.g. behind another caller's transaction bracket).
async fn lock_gate(gate: &Arc<Mutex<()>>, cancel: &CancelToken) -> Result<OwnedMutexGuard<()>> {
    tokio::select! {
        guard = gate.clone().lock_owned() => Ok(guard),
        _ = cancel.cancelled() => Err(Error::Cancelled(
            "cancelled while waiting for the database".to_string(),
        )),
    }
}

impl Engine {
    fn count(&self, name: &str) {
        let mut counts = self.op_counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(name.to_string()).or_insert(0) += 1;
    }

    async fn handle(&self, id: u64, call: MethodCall, cancel: CancelToken) -> Result<Response> {
        self.count(call.name());
        match call {
            MethodCall::Open { filename, pragmas } => self.open(filename, pragmas).await,
            MethodCall::Import { bytes, overwrite } => self.import(bytes, overwrite).await,
            MethodCall::Close => self.close().await,
            other => {
                let guard = self.state.read().await;
                let state = guard.as_ref().ok_or(Error::NotOpen)?;
                self.dispatch(state, id, other, &cancel).await
            }
        }
    }

    async fn dispatch(
        &self,
        state: &EngineState,
        id: u64,
        call: MethodCall,
        cancel: &CancelToken,
    ) -> Result<Response> {
        match call {
            MethodCall::Exec { sql, params, tx } => {
                let in_tx = match tx {
                    Some(token) => {
                        let active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
                        match active.as_ref() {
                            Some(active) if active.token == token => true,
                            _ => {
                                return Err(Error::InvalidRequest(format!(
                                    "no active transaction with token {}",
                                    token
                                )))
                            }
                        }
                    }
                    None => false,
                };

                let result = if in_tx {
                    state.store.exec(&sql, &params).await?
                } else {
                    let _guard = lock_gate(&state.gate, cancel).await?;
                    state.store.exec(&sql, &params).await?
                };
                Ok(Response::Exec(result))
            }

            MethodCall::BulkExec { statements } => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let results = state.store.bulk_exec(&statements).await?;
                Ok(Response::BulkExec { results })
            }

            MethodCall::Begin => {
                {
                    let active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
                    if active.is_some() {
                        return Err(Error::InvalidRequest(
                            "a transaction is already in progress".to_string(),
                        ));
                    }
                }
                let guard = lock_gate(&state.gate, cancel).await?;
                state.store.begin().await?;
                let mut active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
                *active = Some(ActiveTx {
                    token: id,
                    _guard: guard,
                });
                Ok(Response::Begin { tx: id })
            }

            MethodCall::Commit { tx } => {
                let active = self.take_tx(state, tx)?;
                let result = state.store.commit().await;
                if result.is_err() {
                    let _ = state.store.rollback().await;
                }
                drop(active);
                result.map(|_| Response::Unit {})
            }

            MethodCall::Rollback { tx } => {
                let active = self.take_tx(state, tx)?;
                let result = state.store.rollback().await;
                drop(active);
                result.map(|_| Response::Unit {})
            }

            MethodCall::BulkInsert {
                collection,
                documents,
                options,
            } => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let results = state
                    .ingestor
                    .batch_insert(
                        &collection,
                        &documents,
                        &options.unwrap_or_default(),
                        cancel,
                    )
                    .await?;
                Ok(Response::BulkInsert { results })
            }

            MethodCall::Search(request) => {
                let response = state.searcher.search(&request, cancel).await?;
                Ok(Response::Search(response))
            }

            MethodCall::GenerateEmbedding { collection, text } => {
                let collection = {
                    let _guard = lock_gate(&state.gate, cancel).await?;
                    state.store.get_collection(&collection).await?
                };
                let outcome = state.pipeline.embed_query(&collection, &text).await?;
                Ok(Response::Embedding(EmbeddingResponse {
                    dimensions: outcome.vector.len(),
                    vector: outcome.vector,
                    source: outcome.source,
                    processing_ms: outcome.processing_ms,
                }))
            }

            MethodCall::BatchGenerate {
                collection,
                documents,
            } => {
                let collection = {
                    let _guard = lock_gate(&state.gate, cancel).await?;
                    state.store.get_collection(&collection).await?
                };
                let outcome = state
                    .pipeline
                    .batch_generate(&collection, &documents, &mut NoopProgress, cancel)
                    .await?;
                Ok(Response::BatchGenerate(outcome))
            }

            MethodCall::ProcessQueue { limit } => {
                let outcome = state
                    .pipeline
                    .process_queue(limit.unwrap_or(32), cancel)
                    .await?;
                Ok(Response::ProcessQueue(outcome))
            }

            MethodCall::Preload { providers } => {
                state.pipeline.preload(&providers).await?;
                Ok(Response::Unit {})
            }

            MethodCall::CreateCollection(config) => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                state.store.create_collection(&config).await?;
                Ok(Response::Unit {})
            }

            MethodCall::CollectionStatus { name } => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let collection = state.store.get_collection(&name).await?;
                let documents_total = state.store.count_documents(Some(&name)).await?;
                let documents_embedded = state.store.count_embedded(&name).await?;
                let ready = state.pipeline.provider_for(&collection).is_ok();
                Ok(Response::CollectionStatus(CollectionStatus {
                    name: collection.name,
                    provider: collection.provider_id,
                    model: collection.model_id,
                    dimensions: collection.dimensions,
                    documents_total,
                    documents_embedded,
                    ready,
                }))
            }

            MethodCall::ListCollections => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let collections = state.store.list_collections().await?;
                Ok(Response::Collections { collections })
            }

            MethodCall::UpdateDocument {
                collection,
                document,
                options,
            } => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let outcome = state
                    .ingestor
                    .update_document(&collection, &document, &options.unwrap_or_default())
                    .await?;
                Ok(Response::BulkInsert {
                    results: vec![outcome],
                })
            }

            MethodCall::DeleteDocument { collection, id } => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                state.ingestor.delete_document(&collection, &id).await?;
                Ok(Response::Unit {})
            }

            MethodCall::Export => {
                let _guard = lock_gate(&state.gate, cancel).await?;
                let bytes = state.store.export().await?;
                Ok(Response::Export { bytes })
            }

            MethodCall::Version => {
                let engine_version = {
                    let _guard = lock_gate(&state.gate, cancel).await?;
                    state.store.engine_version().await?
                };
                Ok(Response::Version(VersionInfo {
                    engine_version,
                    vector_ext_version: "libsql-native".to_string(),
                    schema_version: SCHEMA_VERSION,
                }))
            }

            MethodCall::Stats => {
                let (db_size_bytes, queue_pending) = {
                    let _guard = lock_gate(&state.gate, cancel).await?;
                    (
                        state.store.db_size_bytes().await?,
                        state.store.queue_len().await?,
                    )
                };
                let pipeline = state.pipeline.status();
                let operation_counts = self
                    .op_counts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                Ok(Response::Stats(Box::new(StatsInfo {
                    db_size_bytes,
                    operation_counts,
                    cache_hit_rates: pipeline.hit_rates.clone(),
                    queue_pending,
                    pipeline,
                })))
            }

            // Handled before dispatch.
            MethodCall::Open { .. } | MethodCall::Import { .. } | MethodCall::Close => {
                Err(Error::InvalidRequest("lifecycle call in dispatch".to_string()))
            }
        }
    }

    fn take_tx(&self, state: &EngineState, token: u64) -> Result<ActiveTx> {
        let mut active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
        match active.take() {
            Some(tx) if tx.token == token => Ok(tx),
            Some(tx) => {
                let expected = tx.token;
                *active = Some(tx);
                Err(Error::InvalidRequest(format!(
                    "transaction token mismatch (active bracket is {})",
                    expected
                )))
            }
            None => Err(Error::InvalidRequest(
                "no transaction in progress".to_string(),
            )),
        }
    }

    async fn open(&self, filename: String, pragmas: Option<PragmaConfig>) -> Result<Response> {
        let mut guard = self.state.write().await;
        if let Some(existing) = guard.as_ref() {
            // Re-opening the same file is a no-op.
            if existing.path == Path::new(&filename) {
                return Ok(Response::Unit {});
            }
            return Err(Error::InvalidRequest(format!(
                "already open ({})",
                existing.path.display()
            )));
        }
        let state = self
            .build_state(PathBuf::from(filename), pragmas.unwrap_or_default())
            .await?;
        *guard = Some(state);
        Ok(Response::Unit {})
    }

    async fn build_state(&self, path: PathBuf, pragmas: PragmaConfig) -> Result<EngineState> {
        let in_memory = path.to_str() == Some(":memory:");
        let store = if in_memory {
            Store::open_memory_with(&pragmas).await?
        } else {
            Store::open(&path, &pragmas).await?
        };
        let store = Arc::new(store);
        let gate = Arc::new(Mutex::new(()));

        let mut pipeline_config = self.pipeline_config.clone();
        if pipeline_config.kv_path.is_none() && !in_memory {
            // Tier-2 cache lives beside the database file.
            let mut kv_path = path.clone().into_os_string();
            kv_path.push(".vcache");
            pipeline_config.kv_path = Some(PathBuf::from(kv_path));
        }

        let pipeline = Arc::new(Pipeline::new(store.clone(), gate.clone(), pipeline_config)?);
        for provider in self
            .providers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            pipeline.register_provider(provider.clone());
        }

        let ingestor = Ingestor::new(store.clone(), pipeline.clone());
        let searcher = Searcher::new(store.clone(), pipeline.clone(), gate.clone());

        tracing::info!("engine opened {}", path.display());
        Ok(EngineState {
            searcher,
            ingestor,
            pipeline,
            store,
            gate,
            active_tx: StdMutex::new(None),
            path,
            pragmas,
        })
    }

    async fn import(&self, bytes: Vec<u8>, overwrite: bool) -> Result<Response> {
        let mut guard = self.state.write().await;
        let Some(state) = guard.as_ref() else {
            return Err(Error::NotOpen);
        };
        if state.path.to_str() == Some(":memory:") {
            return Err(Error::Storage(
                "import requires a file-backed database".to_string(),
            ));
        }
        {
            let active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
            if active.is_some() {
                return Err(Error::InvalidRequest(
                    "cannot import while a transaction is in progress".to_string(),
                ));
            }
        }
        if !overwrite && state.store.count_documents(None).await? > 0 {
            return Err(Error::InvalidRequest(
                "database is not empty; set overwrite to replace it".to_string(),
            ));
        }

        // Unknown schema versions are rejected before anything is replaced.
        Store::validate_import(&bytes).await?;

        let path = state.path.clone();
        let pragmas = state.pragmas.clone();
        // Close the current handle before replacing the file under it.
        *guard = None;
        std::fs::write(&path, &bytes)?;
        *guard = Some(self.build_state(path, pragmas).await?);
        Ok(Response::Unit {})
    }

    async fn close(&self) -> Result<Response> {
        let mut guard = self.state.write().await;
        if let Some(state) = guard.take() {
            let abandoned = {
                let mut active = state.active_tx.lock().unwrap_or_else(|e| e.into_inner());
                active.take()
            };
            if abandoned.is_some() {
                let _ = state.store.rollback().await;
            }
            tracing::info!("engine closed {}", state.path.display());
            // EngineState's field order tears down dependents first.
            drop(state);
        }
        Ok(Response::Unit {})
    }
}

async fn run_request(
    engine: Arc<Engine>,
    envelope: Envelope,
    permit: tokio::sync::OwnedSemaphorePermit,
    cancels: Arc<StdMutex<HashMap<u64, CancelToken>>>,
) {
    let Envelope {
        id,
        call,
        timeout,
        cancel,
        responder,
    } = envelope;
    let name = call.name();

    let mut work = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.handle(id, call, cancel).await }
    });

    tokio::select! {
        joined = &mut work => {
            let result = joined.unwrap_or_else(|e| {
                Err(Error::Cancelled(format!("handler aborted: {}", e)))
            });
            cancels.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            if let Err(error) = &result {
                tracing::debug!("request {} ({}) failed: {}", id, name, error);
            }
            let _ = responder.send(result);
        }
        _ = tokio::time::sleep(timeout) => {
            // Respond immediately; the handler unwinds at its next
            // checkpoint and keeps its permit until it does, so the
            // in-flight cap stays honest.
            cancel.cancel();
            cancels.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            tracing::debug!("request {} ({}) timed out after {} ms", id, name, timeout.as_millis());
            let _ = responder.send(Err(Error::Cancelled(format!(
                "request timed out after {} ms",
                timeout.as_millis()
            ))));
            let _ = work.await;
        }
    }
    drop(permit);
}

/// Foreground handle to the engine. Cheap to clone; all state lives behind
/// the broker.
#[derive(Clone)]
pub struct Database {
    sender: mpsc::Sender<Envelope>,
    next_id: Arc<AtomicU64>,
    cancels: Arc<StdMutex<HashMap<u64, CancelToken>>>,
    default_timeout: Duration,
}

impl Database {
    /// Start a broker with the given configuration and provider registry.
    pub fn launch(
        config: BrokerConfig,
        providers: Vec<Arc<dyn sift_embed::EmbeddingProvider>>,
    ) -> Database {
        let (sender, mut receiver) = mpsc::channel::<Envelope>(config.max_queued.max(1));
        let cancels: Arc<StdMutex<HashMap<u64, CancelToken>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let engine = Arc::new(Engine {
            state: RwLock::new(None),
            providers: StdMutex::new(providers),
            pipeline_config: config.pipeline.clone(),
            op_counts: StdMutex::new(HashMap::new()),
        });
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        let dispatch_cancels = cancels.clone();
        tokio::spawn(async move {
            // Envelopes are admitted in arrival order; the semaphore is the
            // in-flight cap and the channel is the bounded wait queue.
            while let Some(envelope) = receiver.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                tokio::spawn(run_request(
                    engine.clone(),
                    envelope,
                    permit,
                    dispatch_cancels.clone(),
                ));
            }
        });

        Database {
            sender,
            next_id: Arc::new(AtomicU64::new(0)),
            cancels,
            default_timeout: config.default_timeout,
        }
    }

    /// Submit a call without waiting: returns the request id (usable with
    /// [`cancel`]) and the response future.
    ///
    /// [`cancel`]: Database::cancel
    pub fn submit(
        &self,
        call: MethodCall,
        timeout: Option<Duration>,
    ) -> Result<(u64, oneshot::Receiver<Result<Response>>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancelToken::new();
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, cancel.clone());

        let (responder, receiver) = oneshot::channel();
        let envelope = Envelope {
            id,
            call,
            timeout: timeout.unwrap_or(self.default_timeout),
            cancel,
            responder,
        };

        match self.sender.try_send(envelope) {
            Ok(()) => Ok((id, receiver)),
            Err(e) => {
                self.cancels
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(Error::Overloaded),
                    mpsc::error::TrySendError::Closed(_) => Err(Error::NotOpen),
                }
            }
        }
    }

    /// Submit a call and wait for its response.
    pub async fn request(&self, call: MethodCall) -> Result<Response> {
        self.request_with_timeout(call, None).await
    }

    pub async fn request_with_timeout(
        &self,
        call: MethodCall,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let (_, receiver) = self.submit(call, timeout)?;
        receiver
            .await
            .unwrap_or_else(|_| Err(Error::Cancelled("broker shut down".to_string())))
    }

    /// Cancel a pending request by id. Returns whether the id was known.
    pub fn cancel(&self, id: u64) -> bool {
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        match cancels.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Typed convenience surface
    // -------------------------------------------------------------------------

    pub async fn open(&self, filename: &str, pragmas: Option<PragmaConfig>) -> Result<()> {
        self.expect_unit(
            self.request(MethodCall::Open {
                filename: filename.to_string(),
                pragmas,
            })
            .await?,
        )
    }

    pub async fn exec(&self, sql: &str, params: Vec<serde_json::Value>) -> Result<crate::store::ExecResult> {
        match self
            .request(MethodCall::Exec {
                sql: sql.to_string(),
                params,
                tx: None,
            })
            .await?
        {
            Response::Exec(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    /// Execute inside an open transaction bracket.
    pub async fn exec_in_tx(
        &self,
        tx: u64,
        sql: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<crate::store::ExecResult> {
        match self
            .request(MethodCall::Exec {
                sql: sql.to_string(),
                params,
                tx: Some(tx),
            })
            .await?
        {
            Response::Exec(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn bulk_exec(&self, statements: Vec<Statement>) -> Result<Vec<crate::store::ExecResult>> {
        match self.request(MethodCall::BulkExec { statements }).await? {
            Response::BulkExec { results } => Ok(results),
            other => Err(unexpected(&other)),
        }
    }

    /// Open a transaction bracket; the returned token marks its owner.
    pub async fn begin(&self) -> Result<u64> {
        match self.request(MethodCall::Begin).await? {
            Response::Begin { tx } => Ok(tx),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn commit(&self, tx: u64) -> Result<()> {
        self.expect_unit(self.request(MethodCall::Commit { tx }).await?)
    }

    pub async fn rollback(&self, tx: u64) -> Result<()> {
        self.expect_unit(self.request(MethodCall::Rollback { tx }).await?)
    }

    pub async fn bulk_insert(
        &self,
        collection: &str,
        documents: Vec<DocumentInput>,
        options: Option<InsertOptions>,
    ) -> Result<Vec<crate::ingest::InsertOutcome>> {
        match self
            .request(MethodCall::BulkInsert {
                collection: collection.to_string(),
                documents,
                options,
            })
            .await?
        {
            Response::BulkInsert { results } => Ok(results),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        match self.request(MethodCall::Search(request)).await? {
            Response::Search(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn generate_embedding(
        &self,
        collection: &str,
        text: &str,
    ) -> Result<EmbeddingResponse> {
        match self
            .request(MethodCall::GenerateEmbedding {
                collection: collection.to_string(),
                text: text.to_string(),
            })
            .await?
        {
            Response::Embedding(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn batch_generate(
        &self,
        collection: &str,
        documents: Vec<String>,
    ) -> Result<crate::embed::BatchOutcome> {
        match self
            .request(MethodCall::BatchGenerate {
                collection: collection.to_string(),
                documents,
            })
            .await?
        {
            Response::BatchGenerate(outcome) => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn process_queue(&self, limit: Option<usize>) -> Result<crate::embed::QueueOutcome> {
        match self.request(MethodCall::ProcessQueue { limit }).await? {
            Response::ProcessQueue(outcome) => Ok(outcome),
            other => Err(unexpected(&other)),
        }
    }

    /// Eagerly initialize provider state (model weights, sessions).
    pub async fn preload(&self, providers: Vec<String>) -> Result<()> {
        self.expect_unit(self.request(MethodCall::Preload { providers }).await?)
    }

    pub async fn create_collection(&self, config: CollectionConfig) -> Result<()> {
        self.expect_unit(self.request(MethodCall::CreateCollection(config)).await?)
    }

    pub async fn collection_status(&self, name: &str) -> Result<CollectionStatus> {
        match self
            .request(MethodCall::CollectionStatus {
                name: name.to_string(),
            })
            .await?
        {
            Response::CollectionStatus(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn list_collections(&self) -> Result<Vec<crate::store::Collection>> {
        match self.request(MethodCall::ListCollections).await? {
            Response::Collections { collections } => Ok(collections),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn update_document(
        &self,
        collection: &str,
        document: DocumentInput,
        options: Option<InsertOptions>,
    ) -> Result<()> {
        match self
            .request(MethodCall::UpdateDocument {
                collection: collection.to_string(),
                document,
                options,
            })
            .await?
        {
            Response::BulkInsert { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        self.expect_unit(
            self.request(MethodCall::DeleteDocument {
                collection: collection.to_string(),
                id: id.to_string(),
            })
            .await?,
        )
    }

    pub async fn export(&self) -> Result<Vec<u8>> {
        match self.request(MethodCall::Export).await? {
            Response::Export { bytes } => Ok(bytes),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn import(&self, bytes: Vec<u8>, overwrite: bool) -> Result<()> {
        self.expect_unit(self.request(MethodCall::Import { bytes, overwrite }).await?)
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        match self.request(MethodCall::Version).await? {
            Response::Version(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn stats(&self) -> Result<StatsInfo> {
        match self.request(MethodCall::Stats).await? {
            Response::Stats(info) => Ok(*info),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.expect_unit(self.request(MethodCall::Close).await?)
    }

    fn expect_unit(&self, response: Response) -> Result<()> {
        match response {
            Response::Unit {} => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(_response: &Response) -> Error {
    Error::InvalidRequest("unexpected response shape".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use sift_embed::MockProvider;

    const DIMS: usize = 8;

    fn pragmas() -> PragmaConfig {
        let mut pragmas = PragmaConfig::default();
        pragmas.vector_dimensions = DIMS;
        pragmas
    }

    async fn open_db(config: BrokerConfig) -> Database {
        let db = Database::launch(config, vec![Arc::new(MockProvider::new(DIMS))]);
        db.open(":memory:", Some(pragmas())).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_not_open_before_open() {
        let db = Database::launch(BrokerConfig::default(), vec![]);
        let err = db.exec("SELECT 1", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOpen);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let db = open_db(BrokerConfig::default()).await;
        db.open(":memory:", Some(pragmas())).await.unwrap();
        let result = db.exec("SELECT 1", vec![]).await.unwrap();
        assert_eq!(result.rows[0][0], json!(1));
    }

    #[tokio::test]
    async fn test_exec_roundtrip_with_params() {
        let db = open_db(BrokerConfig::default()).await;
        let result = db
            .exec("SELECT ?1 + ?2 AS sum", vec![json!(2), json!(3)])
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["sum"]);
        assert_eq!(result.rows[0][0], json!(5));
    }

    #[tokio::test]
    async fn test_transaction_bracket_excludes_other_callers() {
        let db = open_db(BrokerConfig::default()).await;
        let tx = db.begin().await.unwrap();
        db.exec_in_tx(tx, "CREATE TABLE scratch (x INTEGER)", vec![])
            .await
            .unwrap();
        db.exec_in_tx(tx, "INSERT INTO scratch VALUES (1)", vec![])
            .await
            .unwrap();

        // A non-bracket request waits for the bracket; with a tiny timeout
        // it gets a typed cancellation instead of sneaking inside.
        let err = db
            .request_with_timeout(
                MethodCall::Exec {
                    sql: "SELECT COUNT(*) FROM scratch".to_string(),
                    params: vec![],
                    tx: None,
                },
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        db.commit(tx).await.unwrap();
        let result = db.exec("SELECT COUNT(*) FROM scratch", vec![]).await.unwrap();
        assert_eq!(result.rows[0][0], json!(1));
    }

    #[tokio::test]
    async fn test_rollback_discards_bracket() {
        let db = open_db(BrokerConfig::default()).await;
        db.exec("CREATE TABLE t (x INTEGER)", vec![]).await.unwrap();

        let tx = db.begin().await.unwrap();
        db.exec_in_tx(tx, "INSERT INTO t VALUES (1)", vec![])
            .await
            .unwrap();
        db.rollback(tx).await.unwrap();

        let result = db.exec("SELECT COUNT(*) FROM t", vec![]).await.unwrap();
        assert_eq!(result.rows[0][0], json!(0));
    }

    #[tokio::test]
    async fn test_wrong_tx_token_rejected() {
        let db = open_db(BrokerConfig::default()).await;
        let tx = db.begin().await.unwrap();

        let err = db
            .exec_in_tx(tx + 999, "SELECT 1", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = db.commit(tx + 999).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        db.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_begin_rejected() {
        let db = open_db(BrokerConfig::default()).await;
        let tx = db.begin().await.unwrap();
        let err = db.begin().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        db.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_overload_fails_fast() {
        let mut config = BrokerConfig::default();
        config.max_in_flight = 1;
        config.max_queued = 1;
        config.default_timeout = Duration::from_millis(400);
        let db = open_db(config).await;

        // Occupy the single slot with a bracket, then fill the queue.
        let tx = db.begin().await.unwrap();
        let (_id1, rx1) = db
            .submit(
                MethodCall::Exec {
                    sql: "SELECT 1".to_string(),
                    params: vec![],
                    tx: None,
                },
                None,
            )
            .unwrap();
        // Give the dispatcher a beat to move it into the in-flight slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_id2, rx2) = db
            .submit(
                MethodCall::Exec {
                    sql: "SELECT 2".to_string(),
                    params: vec![],
                    tx: None,
                },
                None,
            )
            .unwrap();

        let overloaded = db.submit(MethodCall::Version, None).unwrap_err();
        assert_eq!(overloaded.kind(), ErrorKind::Overloaded);

        // The blocked requests time out behind the bracket; drain them so
        // the queue frees up, then commit normally.
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        db.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_by_id() {
        let db = open_db(BrokerConfig::default()).await;
        let tx = db.begin().await.unwrap();

        // This request waits behind the bracket until cancelled.
        let (id, receiver) = db
            .submit(
                MethodCall::Exec {
                    sql: "SELECT 1".to_string(),
                    params: vec![],
                    tx: None,
                },
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(db.cancel(id));

        let result = receiver.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);

        db.commit(tx).await.unwrap();
        assert!(!db.cancel(id), "completed ids are unknown");
    }

    #[tokio::test]
    async fn test_close_then_not_open() {
        let db = open_db(BrokerConfig::default()).await;
        db.close().await.unwrap();
        let err = db.exec("SELECT 1", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotOpen);
    }

    #[tokio::test]
    async fn test_stats_counts_operations() {
        let db = open_db(BrokerConfig::default()).await;
        db.exec("SELECT 1", vec![]).await.unwrap();
        db.exec("SELECT 2", vec![]).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.operation_counts.get("exec"), Some(&2));
        assert_eq!(stats.operation_counts.get("open"), Some(&1));
        assert!(stats.db_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_version_reports_schema() {
        let db = open_db(BrokerConfig::default()).await;
        let version = db.version().await.unwrap();
        assert_eq!(version.schema_version, SCHEMA_VERSION);
        assert!(!version.engine_version.is_empty());
    }
}
