//! Request/response protocol types for the broker.
//!
//! The foreground holds only a handle; the engine's entire state graph
//! lives behind the broker. Calls cross that boundary as a typed method
//! enum dispatched by a handler table, and every response is either a
//! success payload or a structured error envelope. No failure crosses the
//! boundary untyped.

use crate::embed::{BatchOutcome, EmbeddingSource, PipelineStatus, QueueOutcome};
use crate::error::{Error, ErrorKind};
use crate::ingest::{DocumentInput, InsertOptions, InsertOutcome};
use crate::search::{SearchRequest, SearchResponse};
use crate::store::{Collection, CollectionConfig, ExecResult, PragmaConfig, Statement};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error envelope carried by every failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl From<&Error> for ErrorEnvelope {
    fn from(error: &Error) -> Self {
        ErrorEnvelope {
            kind: error.kind(),
            message: error.to_string(),
            details: error.details(),
            retryable: error.retryable(),
        }
    }
}

/// A method call, dispatched by variant. Parameters sit inline next to the
/// `method` tag on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MethodCall {
    Open {
        filename: String,
        #[serde(default)]
        pragmas: Option<PragmaConfig>,
    },
    Exec {
        sql: String,
        #[serde(default)]
        params: Vec<Value>,
        /// Transaction token from `begin`; runs inside that bracket.
        #[serde(default)]
        tx: Option<u64>,
    },
    BulkExec {
        statements: Vec<Statement>,
    },
    BulkInsert {
        collection: String,
        documents: Vec<DocumentInput>,
        #[serde(default)]
        options: Option<InsertOptions>,
    },
    Search(SearchRequest),
    GenerateEmbedding {
        collection: String,
        text: String,
    },
    BatchGenerate {
        collection: String,
        documents: Vec<String>,
    },
    ProcessQueue {
        #[serde(default)]
        limit: Option<usize>,
    },
    Preload {
        providers: Vec<String>,
    },
    CreateCollection(CollectionConfig),
    CollectionStatus {
        name: String,
    },
    ListCollections,
    UpdateDocument {
        collection: String,
        document: DocumentInput,
        #[serde(default)]
        options: Option<InsertOptions>,
    },
    DeleteDocument {
        collection: String,
        id: String,
    },
    Begin,
    Commit {
        tx: u64,
    },
    Rollback {
        tx: u64,
    },
    Export,
    Import {
        bytes: Vec<u8>,
        #[serde(default)]
        overwrite: bool,
    },
    Version,
    Stats,
    Close,
}

impl MethodCall {
    /// Stable name used for dispatch logging and operation counters.
    pub fn name(&self) -> &'static str {
        match self {
            MethodCall::Open { .. } => "open",
            MethodCall::Exec { .. } => "exec",
            MethodCall::BulkExec { .. } => "bulk_exec",
            MethodCall::BulkInsert { .. } => "bulk_insert",
            MethodCall::Search(_) => "search",
            MethodCall::GenerateEmbedding { .. } => "generate_embedding",
            MethodCall::BatchGenerate { .. } => "batch_generate",
            MethodCall::ProcessQueue { .. } => "process_queue",
            MethodCall::Preload { .. } => "preload",
            MethodCall::CreateCollection(_) => "create_collection",
            MethodCall::CollectionStatus { .. } => "collection_status",
            MethodCall::ListCollections => "list_collections",
            MethodCall::UpdateDocument { .. } => "update_document",
            MethodCall::DeleteDocument { .. } => "delete_document",
            MethodCall::Begin => "begin",
            MethodCall::Commit { .. } => "commit",
            MethodCall::Rollback { .. } => "rollback",
            MethodCall::Export => "export",
            MethodCall::Import { .. } => "import",
            MethodCall::Version => "version",
            MethodCall::Stats => "stats",
            MethodCall::Close => "close",
        }
    }
}

/// A request envelope: monotonically increasing id plus the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub call: MethodCall,
}

/// A produced embedding with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub dimensions: usize,
    pub source: EmbeddingSource,
    pub processing_ms: u64,
}

/// Collection readiness summary.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub documents_total: i64,
    pub documents_embedded: i64,
    /// True when a matching provider is registered for this collection.
    pub ready: bool,
}

/// Engine identification.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub engine_version: String,
    pub vector_ext_version: String,
    pub schema_version: i64,
}

/// Operational statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsInfo {
    pub db_size_bytes: u64,
    pub operation_counts: std::collections::HashMap<String, u64>,
    pub cache_hit_rates: crate::embed::CacheHitRates,
    pub queue_pending: i64,
    pub pipeline: PipelineStatus,
}

/// Success payloads, one variant per method family.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    Unit {},
    Exec(ExecResult),
    BulkExec { results: Vec<ExecResult> },
    BulkInsert { results: Vec<InsertOutcome> },
    Search(SearchResponse),
    Embedding(EmbeddingResponse),
    BatchGenerate(BatchOutcome),
    ProcessQueue(QueueOutcome),
    Collections { collections: Vec<Collection> },
    CollectionStatus(CollectionStatus),
    Begin { tx: u64 },
    Export { bytes: Vec<u8> },
    Version(VersionInfo),
    Stats(Box<StatsInfo>),
}

/// A response envelope: exactly one of `ok` / `err`, echoing the id.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<Response>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    pub fn success(id: u64, response: Response) -> Self {
        ResponseEnvelope {
            id,
            ok: Some(response),
            err: None,
        }
    }

    pub fn failure(id: u64, error: &Error) -> Self {
        ResponseEnvelope {
            id,
            ok: None,
            err: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_call_wire_shape() {
        let call = MethodCall::Exec {
            sql: "SELECT 1".to_string(),
            params: vec![],
            tx: None,
        };
        let envelope = RequestEnvelope { id: 7, call };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "exec");
        assert_eq!(json["sql"], "SELECT 1");
    }

    #[test]
    fn test_method_call_parses_from_wire() {
        let json = serde_json::json!({
            "id": 3,
            "method": "search",
            "collection": "docs",
            "text": "hello",
            "limit": 5,
            "fusion": "rrf"
        });
        let envelope: RequestEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.id, 3);
        match envelope.call {
            MethodCall::Search(request) => {
                assert_eq!(request.collection, "docs");
                assert_eq!(request.limit, 5);
            }
            other => panic!("expected search, got {}", other.name()),
        }
    }

    #[test]
    fn test_error_envelope_carries_kind_and_retryability() {
        let error = Error::Overloaded;
        let envelope = ErrorEnvelope::from(&error);
        assert_eq!(envelope.kind, ErrorKind::Overloaded);
        assert!(envelope.retryable);

        let json = serde_json::to_value(
            ResponseEnvelope::failure(9, &error),
        )
        .unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["err"]["kind"], "Overloaded");
        assert!(json.get("ok").is_none());
    }

    #[test]
    fn test_success_envelope_shape() {
        let json = serde_json::to_value(ResponseEnvelope::success(
            4,
            Response::Begin { tx: 4 },
        ))
        .unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["ok"]["tx"], 4);
    }

    #[test]
    fn test_method_names_cover_surface() {
        assert_eq!(MethodCall::Begin.name(), "begin");
        assert_eq!(MethodCall::ListCollections.name(), "list_collections");
        assert_eq!(
            MethodCall::Import {
                bytes: vec![],
                overwrite: true
            }
            .name(),
            "import"
        );
    }
}
