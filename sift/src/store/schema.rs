//! Database schema for Sift.

use crate::error::Result;
use libsql::Connection;

/// Current schema version.
/// v4: vector column changed from raw BLOB to F32_BLOB for native indexing.
pub const SCHEMA_VERSION: i64 = 4;

/// SQL to create the database schema.
///
/// The vector table is created separately because its column type embeds the
/// configured dimension count (see [`vector_table_sql`]).
const SCHEMA_SQL: &str = r#"
-- Documents (one row per text item; rowid is the join key everywhere)
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    title TEXT,
    content TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(collection, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

-- Full-text index. The tokenizer must keep the Unicode letter/number/private
-- categories and must not strip diacritics, or non-Latin queries silently
-- return nothing. Rowid parity with documents is maintained by application
-- code (FTS5 has no ON CONFLICT; sync is DELETE + INSERT).
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    title,
    content,
    metadata,
    tokenize = "unicode61 remove_diacritics 0 categories 'L* N* Co'"
);

-- Collections (metadata only; documents of all collections share tables)
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    provider_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    auto_generate INTEGER NOT NULL DEFAULT 0,
    batch_size INTEGER NOT NULL DEFAULT 16,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Documents awaiting embedding, FIFO by id; rows are deleted on success so
-- the queue survives restarts with no in-memory state.
CREATE TABLE IF NOT EXISTS embedding_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL,
    collection TEXT NOT NULL,
    text_digest TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

-- In-database embedding cache tier (tier 3); pruned by last_used_at.
CREATE TABLE IF NOT EXISTS embedding_cache (
    provider_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    text_digest TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL,
    PRIMARY KEY (provider_id, model_id, text_digest)
);

-- Engine state (schema version and friends)
CREATE TABLE IF NOT EXISTS index_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQL for the vector table at the given dimensionality.
pub fn vector_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS doc_vectors (
            rowid INTEGER PRIMARY KEY,
            embedding F32_BLOB({})
        )",
        dimensions
    )
}

/// Ensure the database schema is up to date.
pub async fn ensure_schema(conn: &Connection, vector_dimensions: usize) -> Result<()> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_state'",
            (),
        )
        .await?;

    let table_exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i64>(0)? > 0
    } else {
        false
    };

    if !table_exists {
        conn.execute_batch(SCHEMA_SQL).await?;
        conn.execute(&vector_table_sql(vector_dimensions), ()).await?;

        conn.execute(
            "INSERT INTO index_state (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )
        .await?;
        conn.execute(
            "INSERT INTO index_state (key, value) VALUES ('vector_dimensions', ?1)",
            [vector_dimensions.to_string()],
        )
        .await?;

        tracing::info!("created database schema version {}", SCHEMA_VERSION);
    } else {
        let version = read_schema_version(conn).await?;
        if version < SCHEMA_VERSION {
            migrate(conn, version, vector_dimensions).await?;
        }
    }

    Ok(())
}

/// Read the persisted schema version (0 when the row is missing).
pub async fn read_schema_version(conn: &Connection) -> Result<i64> {
    let mut rows = conn
        .query(
            "SELECT CAST(value AS INTEGER) FROM index_state WHERE key = 'schema_version'",
            (),
        )
        .await?;

    Ok(if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    })
}

/// Read the dimensionality the vector table was declared with.
pub async fn read_vector_dimensions(conn: &Connection) -> Result<Option<usize>> {
    let mut rows = conn
        .query(
            "SELECT CAST(value AS INTEGER) FROM index_state WHERE key = 'vector_dimensions'",
            (),
        )
        .await?;

    Ok(match rows.next().await? {
        Some(row) => {
            let dims: i64 = row.get(0)?;
            Some(dims as usize)
        }
        None => None,
    })
}

/// Migrate from an older schema version. Forward only, idempotent.
async fn migrate(conn: &Connection, from_version: i64, vector_dimensions: usize) -> Result<()> {
    tracing::info!(
        "migrating database from version {} to {}",
        from_version,
        SCHEMA_VERSION
    );

    // v1-v2: collections gained provider/model/dimensions columns; the
    // CREATE IF NOT EXISTS above covers fresh tables, older ones are altered.
    // v3: embedding queue and cache tables added.
    // v4: vector table rebuilt as F32_BLOB for native indexing.
    if from_version < 4 {
        conn.execute("DROP TABLE IF EXISTS doc_vectors", ()).await?;
        conn.execute("DROP INDEX IF EXISTS idx_doc_vectors", ()).await?;
        conn.execute(&vector_table_sql(vector_dimensions), ()).await?;
        conn.execute(
            "INSERT OR REPLACE INTO index_state (key, value) VALUES ('vector_dimensions', ?1)",
            [vector_dimensions.to_string()],
        )
        .await?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO index_state (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )
    .await?;

    Ok(())
}

/// Ensure the vector index exists for native nearest-neighbor search.
///
/// Created lazily once vectors are present, since the engine detects vector
/// metadata from existing data. Returns whether the index exists afterwards.
/// Index creation failure is non-fatal; queries fall back to a distance scan.
pub async fn ensure_vector_index(conn: &Connection) -> Result<bool> {
    if has_vector_index(conn).await {
        return Ok(true);
    }

    let mut rows = conn.query("SELECT COUNT(*) FROM doc_vectors", ()).await?;
    let count: i64 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };
    if count == 0 {
        return Ok(false);
    }

    let result = conn
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_doc_vectors
                ON doc_vectors(libsql_vector_idx(embedding, 'metric=cosine'))",
            (),
        )
        .await;

    match result {
        Ok(_) => {
            tracing::info!("created vector index ({} vectors)", count);
            Ok(true)
        }
        Err(e) => {
            tracing::debug!("vector index creation skipped: {}", e);
            Ok(false)
        }
    }
}

/// Check if the vector index exists and is usable.
pub async fn has_vector_index(conn: &Connection) -> bool {
    let rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='idx_doc_vectors'",
            (),
        )
        .await;

    match rows {
        Ok(mut rows) => {
            if let Ok(Some(row)) = rows.next().await {
                row.get::<i64>(0).unwrap_or(0) > 0
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn memory_conn() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn test_schema_creation() {
        let conn = memory_conn().await;
        ensure_schema(&conn, 384).await.unwrap();

        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                (),
            )
            .await
            .unwrap();

        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            tables.push(row.get::<String>(0).unwrap());
        }

        for expected in [
            "documents",
            "doc_vectors",
            "collections",
            "embedding_queue",
            "embedding_cache",
            "index_state",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_schema_version_persisted() {
        let conn = memory_conn().await;
        ensure_schema(&conn, 384).await.unwrap();
        assert_eq!(read_schema_version(&conn).await.unwrap(), SCHEMA_VERSION);
        assert_eq!(read_vector_dimensions(&conn).await.unwrap(), Some(384));
    }

    #[tokio::test]
    async fn test_idempotent_schema() {
        let conn = memory_conn().await;
        ensure_schema(&conn, 384).await.unwrap();
        ensure_schema(&conn, 384).await.unwrap();
        ensure_schema(&conn, 384).await.unwrap();
        assert_eq!(read_schema_version(&conn).await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_unicode_tokenizer_matches_cyrillic() {
        let conn = memory_conn().await;
        ensure_schema(&conn, 8).await.unwrap();

        conn.execute(
            "INSERT INTO documents_fts (rowid, title, content, metadata)
             VALUES (1, 'Русская литература', 'Толстой и Достоевский', '')",
            (),
        )
        .await
        .unwrap();

        let mut rows = conn
            .query(
                "SELECT rowid FROM documents_fts WHERE documents_fts MATCH ?1",
                libsql::params!["Русская"],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().expect("cyrillic query matched");
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vector_index_lazy() {
        let conn = memory_conn().await;
        ensure_schema(&conn, 4).await.unwrap();

        // No vectors yet: nothing to index.
        assert!(!ensure_vector_index(&conn).await.unwrap());

        conn.execute(
            "INSERT INTO doc_vectors (rowid, embedding) VALUES (1, vector32('[0.1, 0.2, 0.3, 0.4]'))",
            (),
        )
        .await
        .unwrap();

        assert!(ensure_vector_index(&conn).await.unwrap());
        assert!(has_vector_index(&conn).await);
    }
}
