//! Storage engine for Sift.
//!
//! The store owns the single database handle. All SQL traffic for the
//! database lifetime flows through this one `libsql::Connection`; every
//! other component invokes the store's method surface rather than holding
//! the handle. The tables:
//! - documents (rowid is the join key across all per-document tables)
//! - documents_fts (FTS5, rowid-synced manually)
//! - doc_vectors (F32_BLOB vectors, rowid-synced)
//! - collections, embedding_queue, embedding_cache, index_state

mod schema;

use crate::error::{Error, Result};
use chrono::Utc;
use libsql::{params, Builder, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub use schema::SCHEMA_VERSION;

/// Pragmas applied at open.
///
/// The defaults target constrained heaps: a disk journal instead of an
/// in-memory one, and a cache sized well below typical WASM heap budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaConfig {
    pub journal_mode: String,
    pub synchronous: String,
    pub temp_store: String,
    /// Page-cache budget in KiB (applied as a negative `cache_size`).
    pub cache_size_kib: u32,
    /// Dimensionality of the shared vector table.
    pub vector_dimensions: usize,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        PragmaConfig {
            journal_mode: "DELETE".to_string(),
            synchronous: "NORMAL".to_string(),
            temp_store: "MEMORY".to_string(),
            cache_size_kib: 8192,
            vector_dimensions: 384,
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Internal integer key, shared with the lexical and vector rows.
    pub rowid: i64,
    /// Caller-supplied id, unique within the collection.
    pub id: String,
    pub collection: String,
    pub title: Option<String>,
    pub content: String,
    /// Opaque JSON blob.
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub provider_id: String,
    pub model_id: String,
    pub dimensions: usize,
    pub auto_generate: bool,
    pub batch_size: usize,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for creating a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub provider_id: String,
    pub model_id: String,
    pub dimensions: usize,
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_batch_size() -> usize {
    16
}

/// A pending embedding work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub document_id: String,
    pub collection: String,
    pub text_digest: String,
    pub enqueued_at: String,
}

/// Result of a generic SQL execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub affected: u64,
}

/// A statement plus bindings, for `bulk_exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

/// The storage engine. Owns the sole database handle.
pub struct Store {
    conn: Connection,
    // Kept alive for the lifetime of the connection.
    _db: libsql::Database,
    path: PathBuf,
    vector_dimensions: usize,
    vector_indexed: AtomicBool,
}

impl Store {
    /// Open or create a database at the given path and apply pragmas.
    pub async fn open<P: AsRef<Path>>(path: P, pragmas: &PragmaConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Builder::new_local(&path).build().await?;
        let conn = db.connect()?;
        Self::init(conn, db, path, pragmas).await
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        Self::open_memory_with(&PragmaConfig::default()).await
    }

    /// Open an in-memory database with explicit pragmas.
    pub async fn open_memory_with(pragmas: &PragmaConfig) -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        Self::init(conn, db, PathBuf::from(":memory:"), pragmas).await
    }

    async fn init(
        conn: Connection,
        db: libsql::Database,
        path: PathBuf,
        pragmas: &PragmaConfig,
    ) -> Result<Self> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode={};
             PRAGMA synchronous={};
             PRAGMA temp_store={};
             PRAGMA cache_size=-{};",
            pragmas.journal_mode, pragmas.synchronous, pragmas.temp_store, pragmas.cache_size_kib
        ))
        .await?;

        schema::ensure_schema(&conn, pragmas.vector_dimensions).await?;

        // An existing database keeps the dimensionality it was created with.
        let vector_dimensions = schema::read_vector_dimensions(&conn)
            .await?
            .unwrap_or(pragmas.vector_dimensions);

        let vector_indexed = AtomicBool::new(schema::has_vector_index(&conn).await);

        Ok(Store {
            conn,
            _db: db,
            path,
            vector_dimensions,
            vector_indexed,
        })
    }

    /// The database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dimensionality of the shared vector table.
    pub fn vector_dimensions(&self) -> usize {
        self.vector_dimensions
    }

    // -------------------------------------------------------------------------
    // Generic SQL surface
    // -------------------------------------------------------------------------

    /// Execute a statement with positional bindings. SELECT-like statements
    /// return rows; everything else returns the affected-row count.
    pub async fn exec(&self, sql: &str, bindings: &[serde_json::Value]) -> Result<ExecResult> {
        let values = to_sql_values(bindings)?;

        if is_query(sql) {
            let mut rows = self
                .conn
                .query(sql, libsql::params_from_iter(values))
                .await?;

            let column_count = rows.column_count();
            let mut columns = Vec::with_capacity(column_count as usize);
            for i in 0..column_count {
                columns.push(rows.column_name(i).unwrap_or_default().to_string());
            }

            let mut out = Vec::new();
            while let Some(row) = rows.next().await? {
                let mut values = Vec::with_capacity(column_count as usize);
                for i in 0..column_count {
                    values.push(from_sql_value(row.get_value(i)?));
                }
                out.push(values);
            }

            Ok(ExecResult {
                columns,
                rows: out,
                affected: 0,
            })
        } else {
            let affected = self
                .conn
                .execute(sql, libsql::params_from_iter(values))
                .await?;
            Ok(ExecResult {
                affected,
                ..ExecResult::default()
            })
        }
    }

    /// Run a typed query returning raw rows, for internal components that
    /// decode their own column types.
    pub(crate) async fn exec_rows(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<libsql::Rows> {
        Ok(self.conn.query(sql, params).await?)
    }

    /// Execute many statements in order under one implicit transaction.
    pub async fn bulk_exec(&self, statements: &[Statement]) -> Result<Vec<ExecResult>> {
        self.begin().await?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            match self.exec(&statement.sql, &statement.params).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.rollback().await?;
                    return Err(e);
                }
            }
        }
        self.commit().await?;
        Ok(results)
    }

    /// Begin a transaction. Nesting is not supported.
    pub async fn begin(&self) -> Result<()> {
        self.conn.execute("BEGIN", ()).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.conn.execute("COMMIT", ()).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.conn.execute("ROLLBACK", ()).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Export / import
    // -------------------------------------------------------------------------

    /// Serialize the entire database as a byte blob (the engine's native
    /// file format, portable across instances).
    pub async fn export(&self) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let snapshot = dir.path().join("export.db");
        let snapshot_str = snapshot
            .to_str()
            .ok_or_else(|| Error::Storage("non-UTF-8 temp path".to_string()))?;
        self.conn
            .execute("VACUUM INTO ?1", params![snapshot_str])
            .await?;
        Ok(std::fs::read(&snapshot)?)
    }

    /// Validate an imported blob: it must be openable and carry a schema
    /// version this engine supports.
    pub async fn validate_import(bytes: &[u8]) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let candidate = dir.path().join("import.db");
        std::fs::write(&candidate, bytes)?;

        let db = Builder::new_local(&candidate).build().await?;
        let conn = db.connect()?;
        let version = schema::read_schema_version(&conn).await.unwrap_or(0);
        if version == 0 || version > SCHEMA_VERSION {
            return Err(Error::SchemaMismatch {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Document operations
    // -------------------------------------------------------------------------

    /// Insert a document row and return its assigned rowid. The rowid is
    /// never reused; the caller must insert the lexical (and optionally
    /// vector) rows with this exact rowid.
    pub async fn insert_document(
        &self,
        collection: &str,
        id: &str,
        title: Option<&str>,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = match metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        self.conn
            .execute(
                "INSERT INTO documents (doc_id, collection, title, content, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![id, collection, title, content, metadata_json, now],
            )
            .await?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Insert the lexical row for a document. Must use the document's rowid.
    pub async fn insert_fts_row(
        &self,
        rowid: i64,
        title: Option<&str>,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let metadata_text = match metadata {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };
        self.conn
            .execute(
                "INSERT INTO documents_fts (rowid, title, content, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
                params![rowid, title.unwrap_or(""), content, metadata_text],
            )
            .await?;
        Ok(())
    }

    /// FTS5 has no upsert; sync is DELETE then INSERT.
    pub async fn delete_fts_row(&self, rowid: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM documents_fts WHERE rowid = ?1", params![rowid])
            .await?;
        Ok(())
    }

    /// Insert the vector row for a document. Must use the document's rowid.
    pub async fn insert_vector_row(&self, rowid: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.vector_dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.vector_dimensions,
                actual: vector.len(),
            });
        }
        self.conn
            .execute(
                "INSERT OR REPLACE INTO doc_vectors (rowid, embedding) VALUES (?1, vector32(?2))",
                params![rowid, vector_json(vector)],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_vector_row(&self, rowid: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM doc_vectors WHERE rowid = ?1", params![rowid])
            .await?;
        Ok(())
    }

    /// Whether a vector row exists for this rowid (the document is
    /// "embedded" iff it does).
    pub async fn has_vector(&self, rowid: i64) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM doc_vectors WHERE rowid = ?1",
                params![rowid],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i64>(0)? > 0,
            None => false,
        })
    }

    /// Get a document by collection and caller-supplied id.
    pub async fn get_document(&self, collection: &str, id: &str) -> Result<Document> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, doc_id, collection, title, content, metadata, created_at, updated_at
                 FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => document_from_row(&row),
            None => Err(Error::InvalidRequest(format!(
                "document not found: {}/{}",
                collection, id
            ))),
        }
    }

    /// Fetch documents of a collection by rowid, in no particular order.
    /// Callers re-order by their own ranking.
    pub async fn fetch_documents(&self, collection: &str, rowids: &[i64]) -> Result<Vec<Document>> {
        if rowids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=rowids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, doc_id, collection, title, content, metadata, created_at, updated_at
             FROM documents WHERE id IN ({}) AND collection = ?{}",
            placeholders,
            rowids.len() + 1
        );
        let mut values: Vec<libsql::Value> =
            rowids.iter().map(|id| libsql::Value::Integer(*id)).collect();
        values.push(libsql::Value::Text(collection.to_string()));

        let mut rows = self.conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut out = Vec::with_capacity(rowids.len());
        while let Some(row) = rows.next().await? {
            out.push(document_from_row(&row)?);
        }
        Ok(out)
    }

    /// Delete a document and cascade to its lexical row, vector row, and
    /// any pending queue entries. Returns the deleted rowid.
    pub async fn delete_document(&self, collection: &str, id: &str) -> Result<i64> {
        let doc = self.get_document(collection, id).await?;
        self.delete_fts_row(doc.rowid).await?;
        self.delete_vector_row(doc.rowid).await?;
        self.conn
            .execute(
                "DELETE FROM embedding_queue WHERE collection = ?1 AND document_id = ?2",
                params![collection, id],
            )
            .await?;
        self.conn
            .execute("DELETE FROM documents WHERE id = ?1", params![doc.rowid])
            .await?;
        Ok(doc.rowid)
    }

    /// Rewrite a document's mutable fields and bump `updated_at`. The
    /// caller refreshes the lexical/vector rows under the same transaction.
    pub async fn update_document_row(
        &self,
        rowid: i64,
        title: Option<&str>,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let metadata_json = match metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        self.conn
            .execute(
                "UPDATE documents SET title = ?2, content = ?3, metadata = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![rowid, title, content, metadata_json, now],
            )
            .await?;
        Ok(())
    }

    /// Count documents, optionally restricted to a collection.
    pub async fn count_documents(&self, collection: Option<&str>) -> Result<i64> {
        let mut rows = if let Some(name) = collection {
            self.conn
                .query(
                    "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                    params![name],
                )
                .await?
        } else {
            self.conn.query("SELECT COUNT(*) FROM documents", ()).await?
        };
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }

    /// Count documents in a collection that have a vector row.
    pub async fn count_embedded(&self, collection: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM documents d
                 JOIN doc_vectors v ON v.rowid = d.id
                 WHERE d.collection = ?1",
                params![collection],
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }

    /// Row counts across the three per-document tables, for diagnostics
    /// and invariant checks.
    pub async fn table_counts(&self) -> Result<(i64, i64, i64)> {
        let docs = self.count_documents(None).await?;
        let mut rows = self.conn.query("SELECT COUNT(*) FROM documents_fts", ()).await?;
        let fts: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        let mut rows = self.conn.query("SELECT COUNT(*) FROM doc_vectors", ()).await?;
        let vectors: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok((docs, fts, vectors))
    }

    // -------------------------------------------------------------------------
    // Collection operations
    // -------------------------------------------------------------------------

    /// Create a collection. Its declared dimensions must match the shared
    /// vector table's.
    pub async fn create_collection(&self, config: &CollectionConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(Error::InvalidRequest("collection name is empty".to_string()));
        }
        if config.dimensions != self.vector_dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.vector_dimensions,
                actual: config.dimensions,
            });
        }
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO collections
                 (name, provider_id, model_id, dimensions, auto_generate, batch_size, description, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    config.name.as_str(),
                    config.provider_id.as_str(),
                    config.model_id.as_str(),
                    config.dimensions as i64,
                    config.auto_generate as i64,
                    config.batch_size as i64,
                    config.description.as_deref(),
                    now
                ],
            )
            .await?;
        Ok(())
    }

    /// Get a collection by name.
    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, provider_id, model_id, dimensions, auto_generate, batch_size, description, created_at, updated_at
                 FROM collections WHERE name = ?1",
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => collection_from_row(&row),
            None => Err(Error::InvalidRequest(format!(
                "collection not found: {}",
                name
            ))),
        }
    }

    /// List all collections.
    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, provider_id, model_id, dimensions, auto_generate, batch_size, description, created_at, updated_at
                 FROM collections ORDER BY name",
                (),
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(collection_from_row(&row)?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Embedding queue
    // -------------------------------------------------------------------------

    /// Append a work item for later embedding.
    pub async fn enqueue_embedding(
        &self,
        document_id: &str,
        collection: &str,
        text_digest: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO embedding_queue (document_id, collection, text_digest, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![document_id, collection, text_digest, now],
            )
            .await?;
        Ok(())
    }

    /// Oldest pending entries, FIFO.
    pub async fn dequeue_batch(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, document_id, collection, text_digest, enqueued_at
                 FROM embedding_queue ORDER BY id LIMIT ?1",
                params![limit as i64],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(QueueEntry {
                id: row.get(0)?,
                document_id: row.get(1)?,
                collection: row.get(2)?,
                text_digest: row.get(3)?,
                enqueued_at: row.get(4)?,
            });
        }
        Ok(out)
    }

    /// Remove a queue entry once its vector row is stored.
    pub async fn remove_queue_entry(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM embedding_queue WHERE id = ?1", params![id])
            .await?;
        Ok(())
    }

    pub async fn queue_len(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM embedding_queue", ())
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        })
    }

    // -------------------------------------------------------------------------
    // Embedding cache (in-database tier)
    // -------------------------------------------------------------------------

    /// Look up a cached vector and touch its recency.
    pub async fn cache_get(
        &self,
        provider_id: &str,
        model_id: &str,
        text_digest: &str,
    ) -> Result<Option<Vec<f32>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT embedding FROM embedding_cache
                 WHERE provider_id = ?1 AND model_id = ?2 AND text_digest = ?3",
                params![provider_id, model_id, text_digest],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let blob: Vec<u8> = row.get(0)?;
                let now = Utc::now().to_rfc3339();
                self.conn
                    .execute(
                        "UPDATE embedding_cache SET last_used_at = ?4
                         WHERE provider_id = ?1 AND model_id = ?2 AND text_digest = ?3",
                        params![provider_id, model_id, text_digest, now],
                    )
                    .await?;
                Ok(Some(vector_from_bytes(&blob)?))
            }
            None => Ok(None),
        }
    }

    /// Write a vector through to the in-database tier.
    pub async fn cache_put(
        &self,
        provider_id: &str,
        model_id: &str,
        text_digest: &str,
        vector: &[f32],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO embedding_cache
                 (provider_id, model_id, text_digest, dimensions, embedding, created_at, last_used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    provider_id,
                    model_id,
                    text_digest,
                    vector.len() as i64,
                    vector_to_bytes(vector),
                    now
                ],
            )
            .await?;
        Ok(())
    }

    /// Drop the least-recently-used cache rows beyond `max_entries`.
    pub async fn cache_prune(&self, max_entries: usize) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM embedding_cache WHERE rowid IN (
                     SELECT rowid FROM embedding_cache
                     ORDER BY last_used_at DESC
                     LIMIT -1 OFFSET ?1
                 )",
                params![max_entries as i64],
            )
            .await?;
        Ok(affected)
    }

    // -------------------------------------------------------------------------
    // Vector index & stats
    // -------------------------------------------------------------------------

    /// Ensure the native vector index exists once vectors are present.
    /// Cheap after the first success.
    pub async fn ensure_vector_index(&self) -> Result<bool> {
        if self.vector_indexed.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let created = schema::ensure_vector_index(&self.conn).await?;
        if created {
            self.vector_indexed.store(true, Ordering::Relaxed);
        }
        Ok(created)
    }

    /// Database size in bytes (page count x page size, works for memory
    /// databases too).
    pub async fn db_size_bytes(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                (),
            )
            .await?;
        Ok(match rows.next().await? {
            Some(row) => row.get::<i64>(0)? as u64,
            None => 0,
        })
    }

    /// Underlying engine version string.
    pub async fn engine_version(&self) -> Result<String> {
        let mut rows = self.conn.query("SELECT sqlite_version()", ()).await?;
        Ok(match rows.next().await? {
            Some(row) => row.get(0)?,
            None => String::new(),
        })
    }
}

fn document_from_row(row: &libsql::Row) -> Result<Document> {
    let metadata_json: Option<String> = row.get(5)?;
    let metadata = match metadata_json {
        Some(text) if !text.is_empty() => Some(serde_json::from_str(&text)?),
        _ => None,
    };
    Ok(Document {
        rowid: row.get(0)?,
        id: row.get(1)?,
        collection: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        metadata,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn collection_from_row(row: &libsql::Row) -> Result<Collection> {
    let dimensions: i64 = row.get(3)?;
    let auto_generate: i64 = row.get(4)?;
    let batch_size: i64 = row.get(5)?;
    Ok(Collection {
        name: row.get(0)?,
        provider_id: row.get(1)?,
        model_id: row.get(2)?,
        dimensions: dimensions as usize,
        auto_generate: auto_generate != 0,
        batch_size: batch_size.max(1) as usize,
        description: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Whether a statement produces rows.
fn is_query(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(head.as_str(), "SELECT" | "WITH" | "PRAGMA" | "EXPLAIN")
}

fn to_sql_values(bindings: &[serde_json::Value]) -> Result<Vec<libsql::Value>> {
    bindings.iter().map(to_sql_value).collect()
}

fn to_sql_value(value: &serde_json::Value) -> Result<libsql::Value> {
    use serde_json::Value as Json;
    Ok(match value {
        Json::Null => libsql::Value::Null,
        Json::Bool(b) => libsql::Value::Integer(*b as i64),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                libsql::Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                libsql::Value::Real(f)
            } else {
                return Err(Error::InvalidRequest(format!(
                    "unrepresentable number binding: {}",
                    n
                )));
            }
        }
        Json::String(s) => libsql::Value::Text(s.clone()),
        // Arrays and objects bind as their JSON text.
        other => libsql::Value::Text(other.to_string()),
    })
}

fn from_sql_value(value: libsql::Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        libsql::Value::Null => Json::Null,
        libsql::Value::Integer(i) => Json::from(i),
        libsql::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        libsql::Value::Text(s) => Json::String(s),
        libsql::Value::Blob(b) => Json::String(
            b.iter().map(|byte| format!("{:02x}", byte)).collect::<String>(),
        ),
    }
}

/// JSON text form consumed by `vector32()`.
pub fn vector_json(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 10 + 2);
    out.push('[');
    for (i, x) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // Ryu-style shortest form is unnecessary; f32 Display round-trips.
        out.push_str(&x.to_string());
    }
    out.push(']');
    out
}

/// Little-endian f32 bytes, the representation shared by the KV and
/// database cache tiers so coherence checks can compare byte-for-byte.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn vector_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Storage(format!(
            "vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
