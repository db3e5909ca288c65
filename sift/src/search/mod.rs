//! Hybrid search engine.
//!
//! Runs the lexical (FTS5 BM25) and vector (cosine distance) branches as
//! concurrent tasks, fuses their rankings, and hydrates the winning
//! documents in a single statement that preserves fused order.
//!
//! The query text is always parameter-bound into `MATCH`, never spliced
//! into the SQL, so the full Unicode tokenizer sees it; inline literals are
//! fragile across scripts.

pub mod fusion;

use crate::broker::CancelToken;
use crate::embed::Pipeline;
use crate::error::{Error, Result};
use crate::store::{vector_json, Collection, Store};
use fusion::{BranchHit, FusionAlgorithm, FusedHit, RRF_K};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Requested fusion algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionKind {
    #[default]
    Rrf,
    Weighted,
}

/// Branch weights for weighted fusion. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub fts: f64,
    pub vec: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        FusionWeights { fts: 0.5, vec: 0.5 }
    }
}

/// A hybrid search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Lexical query text; empty or absent skips the lexical branch.
    #[serde(default)]
    pub text: Option<String>,
    /// Pre-computed query vector; absent skips the vector branch unless the
    /// collection auto-generates query embeddings from `text`.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    pub collection: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub fusion: FusionKind,
    #[serde(default)]
    pub weights: Option<FusionWeights>,
}

fn default_limit() -> usize {
    10
}

/// One fused search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub title: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vec_rank: Option<usize>,
    /// Which branches surfaced this document ("fts", "vector").
    pub sources: Vec<String>,
    /// Match context from the lexical branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Per-phase timings in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchTiming {
    pub fts_ms: u64,
    pub vec_ms: u64,
    pub embedding_ms: u64,
    pub fusion_ms: u64,
    pub total_ms: u64,
}

/// A completed search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub timing: SearchTiming,
    /// True when one branch failed and results come from the other alone.
    pub partial: bool,
}

struct LexicalBranch {
    hits: Vec<BranchHit>,
    snippets: HashMap<i64, String>,
    elapsed_ms: u64,
}

struct VectorBranch {
    hits: Vec<BranchHit>,
    elapsed_ms: u64,
    embedding_ms: u64,
}

/// The hybrid search engine.
pub struct Searcher {
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
    gate: Arc<Mutex<()>>,
}

impl Searcher {
    pub fn new(store: Arc<Store>, pipeline: Arc<Pipeline>, gate: Arc<Mutex<()>>) -> Self {
        Searcher {
            store,
            pipeline,
            gate,
        }
    }

    /// Execute a hybrid search.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancelToken,
    ) -> Result<SearchResponse> {
        let started = Instant::now();

        let text = request
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if text.is_none() && request.vector.is_none() {
            return Err(Error::InvalidRequest(
                "search needs query text or a query vector".to_string(),
            ));
        }
        if request.limit == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                timing: SearchTiming {
                    total_ms: started.elapsed().as_millis() as u64,
                    ..SearchTiming::default()
                },
                partial: false,
            });
        }

        let algorithm = resolve_fusion(request)?;

        let collection = {
            let _guard = self.gate.lock().await;
            self.store.get_collection(&request.collection).await?
        };

        if let Some(vector) = &request.vector {
            if vector.len() != collection.dimensions {
                return Err(Error::DimensionMismatch {
                    expected: collection.dimensions,
                    actual: vector.len(),
                });
            }
        }

        cancel.check()?;

        let k = (request.limit * 3).max(30);
        let lexical_task = self.lexical_branch(text, &collection, k);
        let vector_task = self.vector_branch(request.vector.clone(), text, &collection, k);
        let (lexical, vector) = tokio::join!(lexical_task, vector_task);

        cancel.check()?;

        // Tolerate a single failed branch; surface the error only when
        // nothing succeeded.
        let mut partial = false;
        let lexical = match lexical {
            Ok(branch) => branch,
            Err(e) => {
                if matches!(vector, Ok(Some(_))) {
                    tracing::warn!("lexical branch failed, returning vector-only: {}", e);
                    partial = true;
                    None
                } else {
                    return Err(e);
                }
            }
        };
        let vector = match vector {
            Ok(branch) => branch,
            Err(e) => {
                if lexical.is_some() {
                    tracing::warn!("vector branch failed, returning lexical-only: {}", e);
                    partial = true;
                    None
                } else {
                    return Err(e);
                }
            }
        };

        let fusion_started = Instant::now();
        let empty: Vec<BranchHit> = Vec::new();
        let lexical_hits = lexical.as_ref().map(|b| &b.hits).unwrap_or(&empty);
        let vector_hits = vector.as_ref().map(|b| &b.hits).unwrap_or(&empty);
        let mut fused = fusion::fuse(lexical_hits, vector_hits, &algorithm);
        fused.truncate(request.limit);
        let fusion_ms = fusion_started.elapsed().as_millis() as u64;

        let snippets = lexical.as_ref().map(|b| &b.snippets);
        let results = self
            .hydrate(&collection.name, &fused, snippets)
            .await?;

        Ok(SearchResponse {
            results,
            timing: SearchTiming {
                fts_ms: lexical.as_ref().map(|b| b.elapsed_ms).unwrap_or(0),
                vec_ms: vector.as_ref().map(|b| b.elapsed_ms).unwrap_or(0),
                embedding_ms: vector.as_ref().map(|b| b.embedding_ms).unwrap_or(0),
                fusion_ms,
                total_ms: started.elapsed().as_millis() as u64,
            },
            partial,
        })
    }

    async fn lexical_branch(
        &self,
        text: Option<&str>,
        collection: &Collection,
        k: usize,
    ) -> Result<Option<LexicalBranch>> {
        let Some(text) = text else {
            return Ok(None);
        };
        let match_query = sanitize_match_query(text);
        if match_query.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let _guard = self.gate.lock().await;
        let mut rows = self
            .store
            .exec_rows(
                "SELECT d.id, bm25(documents_fts) AS score,
                        snippet(documents_fts, 1, '<mark>', '</mark>', '...', 48) AS snippet
                 FROM documents_fts
                 JOIN documents d ON d.id = documents_fts.rowid
                 WHERE documents_fts MATCH ?1 AND d.collection = ?2
                 ORDER BY score
                 LIMIT ?3",
                libsql::params![match_query, collection.name.as_str(), k as i64],
            )
            .await?;

        let mut hits = Vec::new();
        let mut snippets = HashMap::new();
        while let Some(row) = rows.next().await? {
            let rowid: i64 = row.get(0)?;
            let score: f64 = row.get(1)?;
            let snippet: String = row.get(2)?;
            hits.push(BranchHit { rowid, score });
            snippets.insert(rowid, snippet);
        }

        Ok(Some(LexicalBranch {
            hits,
            snippets,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }))
    }

    async fn vector_branch(
        &self,
        vector: Option<Vec<f32>>,
        text: Option<&str>,
        collection: &Collection,
        k: usize,
    ) -> Result<Option<VectorBranch>> {
        let started = Instant::now();
        let mut embedding_ms = 0u64;

        // No explicit vector: derive one from the text when the collection
        // auto-generates query embeddings. This overlaps with the lexical
        // branch because the gate is not held during embedding.
        let vector = match vector {
            Some(vector) => vector,
            None => match text {
                Some(text) if collection.auto_generate => {
                    let embed_started = Instant::now();
                    let outcome = self.pipeline.embed_query(collection, text).await?;
                    embedding_ms = embed_started.elapsed().as_millis() as u64;
                    outcome.vector
                }
                _ => return Ok(None),
            },
        };

        let query_json = vector_json(&vector);
        let _guard = self.gate.lock().await;
        let indexed = self.store.ensure_vector_index().await?;

        let mut rows = if indexed {
            self.store
                .exec_rows(
                    "SELECT t.id, vector_distance_cos(v.embedding, vector32(?1)) AS distance
                     FROM vector_top_k('idx_doc_vectors', vector32(?1), ?3) t
                     JOIN doc_vectors v ON v.rowid = t.id
                     JOIN documents d ON d.id = t.id
                     WHERE d.collection = ?2
                     ORDER BY distance",
                    libsql::params![query_json.as_str(), collection.name.as_str(), k as i64],
                )
                .await?
        } else {
            // No native index yet: brute-force distance scan.
            self.store
                .exec_rows(
                    "SELECT v.rowid, vector_distance_cos(v.embedding, vector32(?1)) AS distance
                     FROM doc_vectors v
                     JOIN documents d ON d.id = v.rowid
                     WHERE d.collection = ?2
                     ORDER BY distance
                     LIMIT ?3",
                    libsql::params![query_json.as_str(), collection.name.as_str(), k as i64],
                )
                .await?
        };

        let mut hits = Vec::new();
        while let Some(row) = rows.next().await? {
            let rowid: i64 = row.get(0)?;
            let distance: f64 = row.get(1)?;
            hits.push(BranchHit {
                rowid,
                score: distance,
            });
        }

        Ok(Some(VectorBranch {
            hits,
            elapsed_ms: started.elapsed().as_millis() as u64,
            embedding_ms,
        }))
    }

    /// Fetch the winning documents with one statement and rebuild them in
    /// fused order.
    async fn hydrate(
        &self,
        collection: &str,
        fused: &[FusedHit],
        snippets: Option<&HashMap<i64, String>>,
    ) -> Result<Vec<SearchHit>> {
        let rowids: Vec<i64> = fused.iter().map(|hit| hit.rowid).collect();
        let documents = {
            let _guard = self.gate.lock().await;
            self.store.fetch_documents(collection, &rowids).await?
        };
        let mut by_rowid: HashMap<i64, crate::store::Document> = documents
            .into_iter()
            .map(|doc| (doc.rowid, doc))
            .collect();

        let mut results = Vec::with_capacity(fused.len());
        for hit in fused {
            let Some(doc) = by_rowid.remove(&hit.rowid) else {
                continue;
            };
            let mut sources = Vec::new();
            if hit.fts_rank.is_some() {
                sources.push("fts".to_string());
            }
            if hit.vec_rank.is_some() {
                sources.push("vector".to_string());
            }
            results.push(SearchHit {
                id: doc.id,
                title: doc.title,
                content: doc.content,
                metadata: doc.metadata,
                score: hit.score,
                fts_rank: hit.fts_rank,
                vec_rank: hit.vec_rank,
                sources,
                snippet: snippets.and_then(|map| map.get(&hit.rowid).cloned()),
            });
        }
        Ok(results)
    }
}

/// Resolve the request's fusion parameters, validating weights.
fn resolve_fusion(request: &SearchRequest) -> Result<FusionAlgorithm> {
    match request.fusion {
        FusionKind::Rrf => Ok(FusionAlgorithm::Rrf { k: RRF_K }),
        FusionKind::Weighted => {
            let weights = request.weights.unwrap_or_default();
            if weights.fts < 0.0 || weights.vec < 0.0 {
                return Err(Error::InvalidRequest(
                    "fusion weights must be non-negative".to_string(),
                ));
            }
            let sum = weights.fts + weights.vec;
            if (sum - 1.0).abs() > 1e-6 {
                return Err(Error::InvalidRequest(format!(
                    "fusion weights must sum to 1.0 (got {})",
                    sum
                )));
            }
            Ok(FusionAlgorithm::Weighted {
                fts: weights.fts,
                vec: weights.vec,
            })
        }
    }
}

/// Sanitize user text into an FTS5 match expression.
///
/// Each whitespace-separated term is reduced to its alphanumeric core
/// (Unicode-aware, so Cyrillic/Greek/CJK terms pass through), quoted, and
/// given prefix matching; terms combine with implicit AND. The result is
/// still bound as a parameter, never interpolated.
pub fn sanitize_match_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter_map(|term| {
            let clean: String = term
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            if clean.is_empty() {
                None
            } else {
                Some(format!("\"{}\"*", clean))
            }
        })
        .collect();
    terms.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Pipeline, PipelineConfig};
    use crate::store::{CollectionConfig, PragmaConfig};
    use sift_embed::MockProvider;

    const DIMS: usize = 8;

    async fn fixture(auto_generate: bool) -> Searcher {
        let mut pragmas = PragmaConfig::default();
        pragmas.vector_dimensions = DIMS;
        let store = Arc::new(Store::open_memory_with(&pragmas).await.unwrap());
        let gate = Arc::new(Mutex::new(()));

        store
            .create_collection(&CollectionConfig {
                name: "docs".to_string(),
                provider_id: "mock".to_string(),
                model_id: "mock-v1".to_string(),
                dimensions: DIMS,
                auto_generate,
                batch_size: 8,
                description: None,
            })
            .await
            .unwrap();

        let pipeline = Arc::new(
            Pipeline::new(store.clone(), gate.clone(), PipelineConfig::default()).unwrap(),
        );
        pipeline.register_provider(Arc::new(MockProvider::new(DIMS)));

        Searcher::new(store, pipeline, gate)
    }

    async fn insert(searcher: &Searcher, id: &str, title: &str, content: &str, embed: bool) {
        let store = &searcher.store;
        let rowid = store
            .insert_document("docs", id, Some(title), content, None)
            .await
            .unwrap();
        store
            .insert_fts_row(rowid, Some(title), content, None)
            .await
            .unwrap();
        if embed {
            let text = crate::embed::embedding_text(Some(title), content);
            store
                .insert_vector_row(rowid, &MockProvider::vector_for(&text, DIMS))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_sanitize_preserves_non_latin() {
        assert_eq!(sanitize_match_query("Русская"), "\"Русская\"*");
        assert_eq!(sanitize_match_query("日本文学"), "\"日本文学\"*");
        assert_eq!(
            sanitize_match_query("machine learning"),
            "\"machine\"* \"learning\"*"
        );
        assert_eq!(sanitize_match_query("@#$%"), "");
        assert_eq!(sanitize_match_query("  "), "");
    }

    #[test]
    fn test_resolve_fusion_validates_weights() {
        let mut request = SearchRequest {
            fusion: FusionKind::Weighted,
            weights: Some(FusionWeights { fts: 0.9, vec: 0.3 }),
            ..SearchRequest::default()
        };
        assert!(resolve_fusion(&request).is_err());

        request.weights = Some(FusionWeights { fts: 0.7, vec: 0.3 });
        assert!(matches!(
            resolve_fusion(&request).unwrap(),
            FusionAlgorithm::Weighted { .. }
        ));

        request.weights = None;
        assert!(matches!(
            resolve_fusion(&request).unwrap(),
            FusionAlgorithm::Weighted { fts, vec } if fts == 0.5 && vec == 0.5
        ));
    }

    #[tokio::test]
    async fn test_text_only_search() {
        let searcher = fixture(false).await;
        insert(&searcher, "a", "Rust guide", "ownership and borrowing", false).await;
        insert(&searcher, "b", "Python guide", "dynamic typing", false).await;

        let response = searcher
            .search(
                &SearchRequest {
                    text: Some("ownership".to_string()),
                    collection: "docs".to_string(),
                    limit: 10,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, "a");
        assert_eq!(response.results[0].sources, vec!["fts"]);
        assert!(response.results[0].snippet.is_some());
        assert!(!response.partial);
    }

    #[tokio::test]
    async fn test_vector_only_search() {
        let searcher = fixture(false).await;
        insert(&searcher, "a", "First", "alpha content", true).await;
        insert(&searcher, "b", "Second", "beta content", true).await;

        let query = MockProvider::vector_for("First\n\nalpha content", DIMS);
        let response = searcher
            .search(
                &SearchRequest {
                    vector: Some(query),
                    collection: "docs".to_string(),
                    limit: 2,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.results.len(), 2);
        // Identical text means zero distance; it must rank first.
        assert_eq!(response.results[0].id, "a");
        assert_eq!(response.results[0].sources, vec!["vector"]);
    }

    #[tokio::test]
    async fn test_hybrid_auto_generated_query_embedding() {
        let searcher = fixture(true).await;
        insert(&searcher, "a", "Machine learning", "neural networks", true).await;
        insert(&searcher, "b", "Cooking", "pasta recipes", true).await;

        let response = searcher
            .search(
                &SearchRequest {
                    text: Some("learning".to_string()),
                    collection: "docs".to_string(),
                    limit: 5,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        let top = &response.results[0];
        assert_eq!(top.id, "a");
        // Auto-generated embedding ran the vector branch too.
        assert!(response.results.iter().any(|r| r.vec_rank.is_some()));
    }

    #[tokio::test]
    async fn test_scores_descend_and_limit_applies() {
        let searcher = fixture(true).await;
        for i in 0..6 {
            insert(
                &searcher,
                &format!("d{}", i),
                "shared words",
                &format!("shared words plus variant {}", i),
                true,
            )
            .await;
        }

        let response = searcher
            .search(
                &SearchRequest {
                    text: Some("shared words".to_string()),
                    collection: "docs".to_string(),
                    limit: 3,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.results.len(), 3);
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_missing_both_inputs_is_invalid() {
        let searcher = fixture(false).await;
        let err = searcher
            .search(
                &SearchRequest {
                    collection: "docs".to_string(),
                    limit: 5,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_zero_limit_returns_empty() {
        let searcher = fixture(false).await;
        let response = searcher
            .search(
                &SearchRequest {
                    text: Some("anything".to_string()),
                    collection: "docs".to_string(),
                    limit: 0,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_vector_dimensions_rejected() {
        let searcher = fixture(false).await;
        let err = searcher
            .search(
                &SearchRequest {
                    vector: Some(vec![0.0; DIMS + 1]),
                    collection: "docs".to_string(),
                    limit: 5,
                    ..SearchRequest::default()
                },
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }
}
