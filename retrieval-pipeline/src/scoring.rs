use std::cmp::Ordering;

use common::storage::types::StoredObject;

/// Rank-fusion constant. Both lanes contribute `1 / (K + rank)`.
pub const RRF_K: f32 = 60.0;

/// Holds optional subscores gathered from the two retrieval signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scores {
    pub vector: Option<f32>,
    pub keyword: Option<f32>,
}

/// Generic wrapper combining an item with its accumulated retrieval scores.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub scores: Scores,
    pub fused: f32,
}

impl<T> Scored<T> {
    pub fn new(item: T) -> Self {
        Self {
            item,
            scores: Scores::default(),
            fused: 0.0,
        }
    }

    pub const fn with_vector_score(mut self, score: f32) -> Self {
        self.scores.vector = Some(score);
        self
    }

    pub const fn with_keyword_score(mut self, score: f32) -> Self {
        self.scores.keyword = Some(score);
        self
    }
}

/// Reciprocal-rank contribution for a 0-based rank.
pub fn rrf_increment(rank: usize) -> f32 {
    1.0 / (RRF_K + rank as f32 + 1.0)
}

/// Fold one ranked lane into the fusion map: RRF mass accumulates, lane
/// scores merge onto whichever entry already exists.
pub fn accumulate_ranked<T>(
    target: &mut std::collections::HashMap<String, Scored<T>>,
    ranked: Vec<Scored<T>>,
) where
    T: StoredObject + Clone,
{
    for (rank, scored) in ranked.into_iter().enumerate() {
        let id = scored.item.get_id().to_owned();
        let entry = target
            .entry(id)
            .or_insert_with(|| Scored::new(scored.item.clone()));
        if let Some(score) = scored.scores.vector {
            entry.scores.vector = Some(score);
        }
        if let Some(score) = scored.scores.keyword {
            entry.scores.keyword = Some(score);
        }
        entry.fused += rrf_increment(rank);
    }
}

/// Highest fused score first, id as the deterministic tiebreak.
pub fn sort_by_fused_desc<T>(items: &mut [Scored<T>])
where
    T: StoredObject,
{
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.get_id().cmp(b.item.get_id()))
    });
}
