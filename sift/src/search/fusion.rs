//! Rank fusion for hybrid search.
//!
//! Both branches deliver raw engine scores where lower is better: BM25 from
//! FTS5 (negative, more negative = more relevant) and cosine distance from
//! the vector table. Fusion converts them into a single higher-is-better
//! score, either rank-based (RRF) or via weighted min-max blending.

use std::collections::HashMap;

/// RRF constant k.
pub const RRF_K: f64 = 60.0;

/// Fusion algorithm with resolved parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionAlgorithm {
    /// Reciprocal Rank Fusion: score = sum of 1/(k + rank) over the sets a
    /// document appears in. Robust when branch scores are not comparable.
    Rrf { k: f64 },
    /// Weighted sum over min-max-normalized branch scores. Weights sum to 1.
    Weighted { fts: f64, vec: f64 },
}

/// One hit from a single branch, in branch rank order (best first).
#[derive(Debug, Clone, Copy)]
pub struct BranchHit {
    pub rowid: i64,
    /// Raw engine score: BM25 for the lexical branch, cosine distance for
    /// the vector branch. Lower is better in both.
    pub score: f64,
}

/// A document after fusion.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub rowid: i64,
    pub score: f64,
    /// 1-based rank in the lexical branch, when present.
    pub fts_rank: Option<usize>,
    /// 1-based rank in the vector branch, when present.
    pub vec_rank: Option<usize>,
}

impl FusedHit {
    fn entry(rowid: i64) -> Self {
        FusedHit {
            rowid,
            score: 0.0,
            fts_rank: None,
            vec_rank: None,
        }
    }

    fn in_both(&self) -> bool {
        self.fts_rank.is_some() && self.vec_rank.is_some()
    }
}

/// Fuse two branch result sets into a single descending ranking.
///
/// Either branch may be empty (text-only or vector-only queries). Ties
/// break toward documents present in both sets, then toward lower rowid,
/// which keeps the ordering deterministic and input-order independent.
pub fn fuse(
    lexical: &[BranchHit],
    vector: &[BranchHit],
    algorithm: &FusionAlgorithm,
) -> Vec<FusedHit> {
    let mut fused: HashMap<i64, FusedHit> = HashMap::new();

    match algorithm {
        FusionAlgorithm::Rrf { k } => {
            for (rank, hit) in lexical.iter().enumerate() {
                let entry = fused
                    .entry(hit.rowid)
                    .or_insert_with(|| FusedHit::entry(hit.rowid));
                entry.score += 1.0 / (k + (rank + 1) as f64);
                entry.fts_rank = Some(rank + 1);
            }
            for (rank, hit) in vector.iter().enumerate() {
                let entry = fused
                    .entry(hit.rowid)
                    .or_insert_with(|| FusedHit::entry(hit.rowid));
                entry.score += 1.0 / (k + (rank + 1) as f64);
                entry.vec_rank = Some(rank + 1);
            }
        }
        FusionAlgorithm::Weighted { fts, vec } => {
            // Both branches report lower-is-better; negate into relevance
            // before min-max so 1.0 is always the branch's best hit.
            let lexical_norm = normalize(lexical);
            let vector_norm = normalize(vector);

            for (rank, (hit, norm)) in lexical.iter().zip(lexical_norm).enumerate() {
                let entry = fused
                    .entry(hit.rowid)
                    .or_insert_with(|| FusedHit::entry(hit.rowid));
                entry.score += norm * fts;
                entry.fts_rank = Some(rank + 1);
            }
            for (rank, (hit, norm)) in vector.iter().zip(vector_norm).enumerate() {
                let entry = fused
                    .entry(hit.rowid)
                    .or_insert_with(|| FusedHit::entry(hit.rowid));
                entry.score += norm * vec;
                entry.vec_rank = Some(rank + 1);
            }
        }
    }

    let mut out: Vec<FusedHit> = fused.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.in_both().cmp(&a.in_both()))
            .then_with(|| a.rowid.cmp(&b.rowid))
    });
    out
}

/// Min-max normalize a branch into [0, 1], higher-better. A degenerate
/// range (single hit, or all scores equal) normalizes to 1.0.
fn normalize(hits: &[BranchHit]) -> Vec<f64> {
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            if max > min {
                // Invert: the branch's lowest raw score is its best hit.
                (max - h.score) / (max - min)
            } else {
                1.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(pairs: &[(i64, f64)]) -> Vec<BranchHit> {
        pairs
            .iter()
            .map(|(rowid, score)| BranchHit {
                rowid: *rowid,
                score: *score,
            })
            .collect()
    }

    #[test]
    fn test_rrf_document_in_both_sets_wins() {
        let lexical = hits(&[(1, -3.0), (2, -2.0), (3, -1.0)]);
        let vector = hits(&[(2, 0.1), (4, 0.2)]);

        let fused = fuse(&lexical, &vector, &FusionAlgorithm::Rrf { k: RRF_K });
        assert_eq!(fused[0].rowid, 2);
        assert_eq!(fused[0].fts_rank, Some(2));
        assert_eq!(fused[0].vec_rank, Some(1));

        let expected = 1.0 / (60.0 + 2.0) + 1.0 / (60.0 + 1.0);
        assert!((fused[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_commutative_in_inputs() {
        let a = hits(&[(1, -3.0), (2, -2.0)]);
        let b = hits(&[(2, 0.1), (3, 0.4)]);

        let forward = fuse(&a, &b, &FusionAlgorithm::Rrf { k: RRF_K });
        let backward = fuse(&b, &a, &FusionAlgorithm::Rrf { k: RRF_K });

        let forward_ids: Vec<i64> = forward.iter().map(|h| h.rowid).collect();
        let backward_ids: Vec<i64> = backward.iter().map(|h| h.rowid).collect();
        assert_eq!(forward_ids, backward_ids);
        for (f, b) in forward.iter().zip(&backward) {
            assert!((f.score - b.score).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rrf_scores_strictly_decrease_without_exact_ties() {
        let lexical = hits(&[(1, -5.0), (2, -4.0), (3, -3.0)]);
        let vector = hits(&[(1, 0.1), (3, 0.2), (4, 0.3)]);
        let fused = fuse(&lexical, &vector, &FusionAlgorithm::Rrf { k: RRF_K });
        for pair in fused.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_tie_breaks_prefer_both_sets_then_rowid() {
        // Rowids 1 and 2 get identical RRF mass: 1 is rank 1 lexically only,
        // 2 is rank 1 in the vector set only; 3 appears rank 2 in both.
        let lexical = hits(&[(1, -5.0), (3, -4.0)]);
        let vector = hits(&[(2, 0.1), (3, 0.2)]);
        let fused = fuse(&lexical, &vector, &FusionAlgorithm::Rrf { k: RRF_K });

        // 3's combined mass beats the single-set hits.
        assert_eq!(fused[0].rowid, 3);
        // 1 and 2 tie on score and set count; lower rowid first.
        assert_eq!(fused[1].rowid, 1);
        assert_eq!(fused[2].rowid, 2);
    }

    #[test]
    fn test_weighted_fusion_blends_normalized_scores() {
        let lexical = hits(&[(1, -4.0), (2, -2.0)]);
        let vector = hits(&[(2, 0.1), (1, 0.3)]);

        let fused = fuse(
            &lexical,
            &vector,
            &FusionAlgorithm::Weighted { fts: 0.5, vec: 0.5 },
        );

        // Rowid 1: best lexical (1.0) + worst vector (0.0) = 0.5
        // Rowid 2: worst lexical (0.0) + best vector (1.0) = 0.5
        // Tie on score, both in both sets; rowid 1 first.
        assert_eq!(fused[0].rowid, 1);
        assert!((fused[0].score - 0.5).abs() < 1e-12);
        assert!((fused[1].score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_degenerate_range_normalizes_to_one() {
        let lexical = hits(&[(7, -2.0)]);
        let fused = fuse(
            &lexical,
            &[],
            &FusionAlgorithm::Weighted { fts: 0.7, vec: 0.3 },
        );
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_single_branch_passthrough() {
        let vector = hits(&[(1, 0.1), (2, 0.2), (3, 0.3)]);
        let fused = fuse(&[], &vector, &FusionAlgorithm::Rrf { k: RRF_K });
        let ids: Vec<i64> = fused.iter().map(|h| h.rowid).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(fused.iter().all(|h| h.fts_rank.is_none()));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(fuse(&[], &[], &FusionAlgorithm::Rrf { k: RRF_K }).is_empty());
    }
}
