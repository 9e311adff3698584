use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{db::SurrealDbClient, types::exchange::Exchange},
};

use crate::RetrievedExchange;

/// Dense lane over prior reasoning: scoped cosine search with a similarity
/// floor. No embedding, no results — the episodic lane covers keyword-only
/// degradation.
pub async fn process_lane(
    db: &SurrealDbClient,
    scope: &MemoryScope,
    query_embedding: Option<&[f32]>,
    top_k: usize,
    min_score: f32,
) -> Result<Vec<RetrievedExchange>, AppError> {
    if scope.is_empty() {
        return Ok(Vec::new());
    }
    let Some(embedding) = query_embedding else {
        return Ok(Vec::new());
    };

    let hits = Exchange::vector_search(top_k, embedding.to_vec(), scope, db).await?;

    Ok(hits
        .into_iter()
        .filter(|hit| hit.score >= min_score)
        .map(|hit| RetrievedExchange {
            exchange: hit.exchange,
            score: hit.score,
        })
        .collect())
}
