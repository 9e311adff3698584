use std::collections::HashMap;

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{db::SurrealDbClient, types::exchange::Exchange},
};

use crate::{
    scoring::{accumulate_ranked, sort_by_fused_desc, Scored},
    timeframe::TimeRange,
    RetrievedExchange,
};

/// Hybrid lane over full exchanges: vector rank and BM25 rank fused with
/// reciprocal-rank fusion. Degrades to keyword-only when no embedding is
/// available.
pub async fn episodic_lane(
    db: &SurrealDbClient,
    scope: &MemoryScope,
    query_text: &str,
    query_embedding: Option<&[f32]>,
    top_k: usize,
    timeframe: Option<TimeRange>,
) -> Result<Vec<RetrievedExchange>, AppError> {
    if scope.is_empty() {
        return Ok(Vec::new());
    }

    // Oversample both lanes so fusion has something to disagree about.
    let lane_take = top_k.max(1) * 3;

    let keyword_hits = Exchange::fts_search(
        lane_take,
        query_text,
        scope,
        timeframe.and_then(|t| t.from),
        timeframe.and_then(|t| t.to),
        db,
    )
    .await?;

    let vector_hits = match query_embedding {
        Some(embedding) => {
            let hits = Exchange::vector_search(lane_take, embedding.to_vec(), scope, db).await?;
            match timeframe {
                // The vector index has no time dimension; narrow afterwards.
                Some(range) => hits
                    .into_iter()
                    .filter(|hit| range.contains(hit.exchange.created_at))
                    .collect(),
                None => hits,
            }
        }
        None => Vec::new(),
    };

    let mut fused: HashMap<String, Scored<Exchange>> = HashMap::new();
    accumulate_ranked(
        &mut fused,
        vector_hits
            .into_iter()
            .map(|hit| Scored::new(hit.exchange).with_vector_score(hit.score))
            .collect(),
    );
    accumulate_ranked(
        &mut fused,
        keyword_hits
            .into_iter()
            .map(|hit| Scored::new(hit.exchange).with_keyword_score(hit.score))
            .collect(),
    );

    let mut items: Vec<Scored<Exchange>> = fused.into_values().collect();
    sort_by_fused_desc(&mut items);
    items.truncate(top_k);

    Ok(items
        .into_iter()
        .map(|scored| RetrievedExchange {
            exchange: scored.item,
            score: scored.fused,
        })
        .collect())
}
