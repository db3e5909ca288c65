//! Ingest coordinator.
//!
//! Turns a batch of documents into persistent, searchable entries
//! atomically: document row, lexical row, and (when an embedding is
//! available in time) vector row, all under one transaction on the one
//! database handle. Splitting the transaction and the inserts across
//! handles silently yields a non-transactional insert; this coordinator
//! exists to make that impossible.
//!
//! Callers (the broker) hold the SQL gate across each call here, so the
//! transaction owns the handle until it commits or rolls back.

use crate::broker::CancelToken;
use crate::embed::{embedding_text, text_digest, Pipeline};
use crate::error::{Error, Result};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// A document to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Caller-supplied id, unique within the collection.
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    /// Opaque JSON blob.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Options for a batch insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertOptions {
    /// Overrides the collection's `auto_generate` flag.
    #[serde(default)]
    pub generate_embedding: Option<bool>,
    /// Budget for one synchronous embedding attempt per document. On
    /// timeout the document is queued, not failed.
    #[serde(default)]
    pub embed_budget_ms: Option<u64>,
}

const DEFAULT_EMBED_BUDGET_MS: u64 = 200;

/// Per-document outcome of a batch insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub id: String,
    /// Whether a vector row was written during the batch. False means the
    /// document was queued for asynchronous embedding.
    pub embedding_generated: bool,
}

/// The ingest coordinator.
pub struct Ingestor {
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
}

impl Ingestor {
    pub fn new(store: Arc<Store>, pipeline: Arc<Pipeline>) -> Self {
        Ingestor { store, pipeline }
    }

    /// Insert a batch of documents atomically. After any failure the
    /// document, lexical, and vector row counts are unchanged from the
    /// pre-call state.
    pub async fn batch_insert(
        &self,
        collection_name: &str,
        documents: &[DocumentInput],
        options: &InsertOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<InsertOutcome>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        // All validation happens before the transaction opens.
        validate_batch(documents)?;
        let collection = self.store.get_collection(collection_name).await?;
        let generate = options
            .generate_embedding
            .unwrap_or(collection.auto_generate);
        let budget =
            Duration::from_millis(options.embed_budget_ms.unwrap_or(DEFAULT_EMBED_BUDGET_MS));

        self.store.begin().await?;

        let mut outcomes = Vec::with_capacity(documents.len());
        for (index, doc) in documents.iter().enumerate() {
            if cancel.is_cancelled() {
                let _ = self.store.rollback().await;
                return Err(Error::Cancelled("batch insert cancelled".to_string()));
            }

            let rowid = match self
                .store
                .insert_document(
                    collection_name,
                    &doc.id,
                    doc.title.as_deref(),
                    &doc.content,
                    doc.metadata.as_ref(),
                )
                .await
            {
                Ok(rowid) => rowid,
                Err(e) => {
                    let _ = self.store.rollback().await;
                    return Err(e.with_document_index(index));
                }
            };

            if let Err(e) = self
                .store
                .insert_fts_row(rowid, doc.title.as_deref(), &doc.content, doc.metadata.as_ref())
                .await
            {
                let _ = self.store.rollback().await;
                return Err(e.with_document_index(index));
            }

            let mut embedding_generated = false;
            if generate {
                let text = embedding_text(doc.title.as_deref(), &doc.content);
                match self.pipeline.try_embed_within(&collection, &text, budget).await {
                    Some(vector) => {
                        if let Err(e) = self.store.insert_vector_row(rowid, &vector).await {
                            let _ = self.store.rollback().await;
                            return Err(e.with_document_index(index));
                        }
                        embedding_generated = true;
                    }
                    None => {
                        // Slow or remote provider: persist the document now,
                        // leave the vector to the queue consumer.
                        if let Err(e) = self
                            .store
                            .enqueue_embedding(&doc.id, collection_name, &text_digest(&text))
                            .await
                        {
                            let _ = self.store.rollback().await;
                            return Err(e.with_document_index(index));
                        }
                    }
                }
            }

            outcomes.push(InsertOutcome {
                id: doc.id.clone(),
                embedding_generated,
            });
        }

        self.store.commit().await?;
        tracing::debug!(
            "batch insert committed: {} documents into '{}'",
            outcomes.len(),
            collection_name
        );
        Ok(outcomes)
    }

    /// Rewrite a document, refreshing its lexical and vector rows under the
    /// same transaction. The old vector is dropped; a new one is written
    /// when it can be produced within the budget, otherwise the document is
    /// re-queued.
    pub async fn update_document(
        &self,
        collection_name: &str,
        doc: &DocumentInput,
        options: &InsertOptions,
    ) -> Result<InsertOutcome> {
        validate_document(doc, 0)?;
        let collection = self.store.get_collection(collection_name).await?;
        let existing = self.store.get_document(collection_name, &doc.id).await?;
        let generate = options
            .generate_embedding
            .unwrap_or(collection.auto_generate);
        let budget =
            Duration::from_millis(options.embed_budget_ms.unwrap_or(DEFAULT_EMBED_BUDGET_MS));

        self.store.begin().await?;

        let result: Result<bool> = async {
            self.store
                .update_document_row(
                    existing.rowid,
                    doc.title.as_deref(),
                    &doc.content,
                    doc.metadata.as_ref(),
                )
                .await?;

            // FTS5 has no upsert; resync is delete then insert.
            self.store.delete_fts_row(existing.rowid).await?;
            self.store
                .insert_fts_row(
                    existing.rowid,
                    doc.title.as_deref(),
                    &doc.content,
                    doc.metadata.as_ref(),
                )
                .await?;

            self.store.delete_vector_row(existing.rowid).await?;
            if !generate {
                return Ok(false);
            }

            let text = embedding_text(doc.title.as_deref(), &doc.content);
            match self.pipeline.try_embed_within(&collection, &text, budget).await {
                Some(vector) => {
                    self.store.insert_vector_row(existing.rowid, &vector).await?;
                    Ok(true)
                }
                None => {
                    self.store
                        .enqueue_embedding(&doc.id, collection_name, &text_digest(&text))
                        .await?;
                    Ok(false)
                }
            }
        }
        .await;

        match result {
            Ok(embedding_generated) => {
                self.store.commit().await?;
                Ok(InsertOutcome {
                    id: doc.id.clone(),
                    embedding_generated,
                })
            }
            Err(e) => {
                let _ = self.store.rollback().await;
                Err(e)
            }
        }
    }

    /// Delete a document, cascading to its lexical and vector rows and any
    /// pending queue entries, under one transaction.
    pub async fn delete_document(&self, collection_name: &str, id: &str) -> Result<()> {
        self.store.begin().await?;
        match self.store.delete_document(collection_name, id).await {
            Ok(_) => self.store.commit().await,
            Err(e) => {
                let _ = self.store.rollback().await;
                Err(e)
            }
        }
    }
}

fn validate_document(doc: &DocumentInput, index: usize) -> Result<()> {
    if doc.id.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "document {} has an empty id",
            index
        )));
    }
    if doc.content.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "document '{}' has empty content",
            doc.id
        )));
    }
    Ok(())
}

fn validate_batch(documents: &[DocumentInput]) -> Result<()> {
    let mut seen = HashSet::with_capacity(documents.len());
    for (index, doc) in documents.iter().enumerate() {
        validate_document(doc, index)?;
        if !seen.insert(doc.id.as_str()) {
            // Rejected before the transaction ever opens.
            return Err(Error::ConstraintViolation {
                message: format!("duplicate id '{}' within batch", doc.id),
                document_index: Some(index),
            });
        }
    }
    Ok(())
}
