use std::cmp::Ordering;

use tracing::debug;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::document_chunk::{DocumentChunk, DocumentHit},
    },
};

/// Boost applied when a procedural chunk answers a how-to question. Only the
/// ordering sees the boost; the threshold judges the raw cosine score.
const PROCEDURE_BOOST: f32 = 0.1;

/// The intent label that marks a how-to question.
const INTENT_HOW_TO: &str = "how_to";

/// A smart-RAG document query. `embedding = None` switches the store into
/// keyword-only mode.
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub embedding: Option<Vec<f32>>,
    pub tenant_id: String,
    pub allowed_departments: Vec<String>,
    pub intent: Option<String>,
    pub entities: Vec<String>,
    pub verbs: Vec<String>,
    pub threshold: f32,
    pub safety_cap: usize,
}

/// A chunk that survived pre-filter and threshold, carrying both the raw
/// cosine score and the boosted score the ordering used.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub chunk: DocumentChunk,
    pub score: f32,
    pub boosted_score: f32,
}

/// Pre-filter, then score, then threshold. Every candidate at or above the
/// threshold is returned, up to the safety cap; there is no hidden top-k.
pub async fn search_documents(
    db: &SurrealDbClient,
    query: DocumentQuery,
) -> Result<Vec<RetrievedDocument>, AppError> {
    if query.allowed_departments.is_empty() {
        return Ok(Vec::new());
    }

    let cap = if query.safety_cap == 0 { 200 } else { query.safety_cap };

    let mut results = match &query.embedding {
        Some(embedding) => {
            let hits = DocumentChunk::vector_candidates(
                embedding.clone(),
                &query.tenant_id,
                &query.allowed_departments,
                query.intent.as_deref(),
                &query.entities,
                &query.verbs,
                // Oversample so the threshold, not the candidate query,
                // decides what makes the cut.
                cap * 5,
                db,
            )
            .await?;

            let mut results = hits
                .into_iter()
                .filter(|hit| hit.score >= query.threshold)
                .map(|hit| to_retrieved(hit, query.intent.as_deref()))
                .collect::<Vec<_>>();
            results.sort_by(compare_documents);
            results
        }
        None => {
            let mut results = keyword_mode(db, &query, cap).await?;
            results.sort_by(compare_keyword_documents);
            results
        }
    };

    results.truncate(cap);

    debug!(
        tenant_id = %query.tenant_id,
        results = results.len(),
        keyword_only = query.embedding.is_none(),
        "document retrieval complete"
    );

    Ok(results)
}

/// Keyword-only ranking: overlap count of requested entities and verbs,
/// then importance. No similarity threshold applies.
async fn keyword_mode(
    db: &SurrealDbClient,
    query: &DocumentQuery,
    cap: usize,
) -> Result<Vec<RetrievedDocument>, AppError> {
    let rows = DocumentChunk::keyword_candidates(
        &query.tenant_id,
        &query.allowed_departments,
        query.intent.as_deref(),
        &query.entities,
        &query.verbs,
        cap * 5,
        db,
    )
    .await?;

    Ok(rows
        .into_iter()
        .map(|chunk| {
            let overlap = overlap_count(&chunk.entities, &query.entities)
                + overlap_count(&chunk.verbs, &query.verbs);
            let hit = DocumentHit {
                chunk,
                score: overlap as f32,
            };
            to_retrieved(hit, query.intent.as_deref())
        })
        .collect())
}

fn overlap_count(have: &[String], want: &[String]) -> usize {
    have.iter().filter(|item| want.contains(item)).count()
}

fn to_retrieved(hit: DocumentHit, intent: Option<&str>) -> RetrievedDocument {
    let boosted = if hit.chunk.is_procedure && intent == Some(INTENT_HOW_TO) {
        hit.score + PROCEDURE_BOOST
    } else {
        hit.score
    };
    RetrievedDocument {
        chunk: hit.chunk,
        score: hit.score,
        boosted_score: boosted,
    }
}

/// Vector-mode ordering key: importance DESC, boosted score DESC,
/// process_step ASC with NULLS LAST, id as the stable tail.
fn compare_documents(a: &RetrievedDocument, b: &RetrievedDocument) -> Ordering {
    b.chunk
        .importance
        .cmp(&a.chunk.importance)
        .then_with(|| {
            b.boosted_score
                .partial_cmp(&a.boosted_score)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| match (a.chunk.process_step, b.chunk.process_step) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

/// Keyword-mode ordering key: tag overlap count DESC, then importance DESC.
/// The overlap count rides in `score`.
fn compare_keyword_documents(a: &RetrievedDocument, b: &RetrievedDocument) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.chunk.importance.cmp(&a.chunk.importance))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

/// A chunk plus its prerequisites and see-also set. Thin wrapper so callers
/// stay off the storage type.
pub async fn expand_context(
    db: &SurrealDbClient,
    chunk_id: &str,
) -> Result<Vec<DocumentChunk>, AppError> {
    DocumentChunk::expand_context(chunk_id, db).await
}
