//! Reciprocal Rank Fusion across ranked lists.
//!
//! Each input list is pre-sorted best-first. The first two lists (the primary
//! vector and full-text channels) weigh 2.0, every later list 1.0. An item at
//! zero-based rank `r` contributes `weight / (K + r + 1) + bonus(r)`, and
//! contributions for the same `(doc_type, id)` key accumulate.

use serde::Serialize;
use std::collections::HashMap;

const K: f64 = 60.0;

const PRIMARY_WEIGHT: f64 = 2.0;
const SECONDARY_WEIGHT: f64 = 1.0;
const PRIMARY_LISTS: usize = 2;

/// A ranked item, keyed by document type and numeric source ID.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredId {
    pub doc_type: String,
    pub id: i64,
    pub score: f64,
}

impl ScoredId {
    pub fn new(doc_type: impl Into<String>, id: i64, score: f64) -> Self {
        Self {
            doc_type: doc_type.into(),
            id,
            score,
        }
    }
}

/// Map an unbounded relevance score (e.g. bm25) into `[0, 1)`.
pub fn normalize(score: f64) -> f64 {
    let s = score.abs();
    s / (1.0 + s)
}

fn top_rank_bonus(rank: usize) -> f64 {
    match rank {
        0 => 0.05,
        1 | 2 => 0.02,
        _ => 0.0,
    }
}

/// Fuse ranked lists into one list sorted by accumulated score, best first.
pub fn fuse(lists: &[Vec<ScoredId>]) -> Vec<ScoredId> {
    let mut scores: HashMap<(String, i64), f64> = HashMap::new();
    // first-seen order keeps ties deterministic
    let mut order: Vec<(String, i64)> = Vec::new();

    for (list_idx, list) in lists.iter().enumerate() {
        let weight = if list_idx < PRIMARY_LISTS {
            PRIMARY_WEIGHT
        } else {
            SECONDARY_WEIGHT
        };
        for (rank, item) in list.iter().enumerate() {
            let contribution = weight / (K + rank as f64 + 1.0) + top_rank_bonus(rank);
            let key = (item.doc_type.clone(), item.id);
            match scores.get_mut(&key) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(key.clone(), contribution);
                    order.push(key);
                }
            }
        }
    }

    let mut fused: Vec<ScoredId> = order
        .into_iter()
        .map(|key| {
            let score = scores.get(&key).copied().unwrap_or_default();
            ScoredId {
                doc_type: key.0,
                id: key.1,
                score,
            }
        })
        .collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}
