//! # Sift
//!
//! An embeddable hybrid retrieval engine over SQLite (via libsql) that
//! unifies three search modalities over one corpus of text documents:
//!
//! - **BM25 full-text search** via FTS5 with a Unicode-aware tokenizer
//! - **Vector similarity search** via native F32 vectors
//! - **Hybrid search** fusing both with Reciprocal Rank Fusion or
//!   weighted blending
//!
//! All data persists locally. Everything stateful runs behind an
//! asynchronous request broker, so the [`Database`] handle is safe to call
//! from a UI thread or any other latency-sensitive context. Embeddings are
//! produced by pluggable providers (see `sift-embed`) behind a three-tier
//! cache.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use sift::{BrokerConfig, CollectionConfig, Database, DocumentInput, SearchRequest};
//! use sift_embed::MockProvider;
//! use std::sync::Arc;
//!
//! let db = Database::launch(BrokerConfig::default(), vec![Arc::new(MockProvider::new(384))]);
//! db.open("index.db", None).await?;
//!
//! db.create_collection(CollectionConfig {
//!     name: "notes".into(),
//!     provider_id: "mock".into(),
//!     model_id: "mock-v1".into(),
//!     dimensions: 384,
//!     auto_generate: true,
//!     batch_size: 16,
//!     description: None,
//! })
//! .await?;
//!
//! db.bulk_insert("notes", vec![DocumentInput {
//!     id: "hello".into(),
//!     title: Some("Hello".into()),
//!     content: "hybrid search in the small".into(),
//!     metadata: None,
//! }], None)
//! .await?;
//!
//! let results = db.search(SearchRequest {
//!     text: Some("hybrid".into()),
//!     collection: "notes".into(),
//!     limit: 10,
//!     ..Default::default()
//! })
//! .await?;
//! ```

pub mod broker;
pub mod embed;
pub mod error;
pub mod ingest;
pub mod search;
pub mod store;

// Re-exports for convenience
pub use broker::protocol::{MethodCall, Response};
pub use broker::{BrokerConfig, CancelToken, Database};
pub use error::{Error, ErrorKind, Result};
pub use ingest::{DocumentInput, InsertOptions, InsertOutcome};
pub use search::{FusionKind, FusionWeights, SearchRequest, SearchResponse};
pub use store::{Collection, CollectionConfig, Document, PragmaConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
