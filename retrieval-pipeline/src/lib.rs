pub mod documents;
pub mod episodic;
pub mod process;
pub mod scoring;
pub mod timeframe;

use std::time::Duration;

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{db::SurrealDbClient, types::exchange::Exchange},
};
use tracing::instrument;

pub use documents::{search_documents, DocumentQuery, RetrievedDocument};
pub use timeframe::{parse_timeframe, TimeRange};

/// An exchange surfaced by either lane, with the score that ranked it.
#[derive(Debug, Clone)]
pub struct RetrievedExchange {
    pub exchange: Exchange,
    pub score: f32,
}

/// Both lanes of one retrieval pass. Ids may repeat across lanes; dedupe is
/// the tool executor's call.
#[derive(Debug, Clone, Default)]
pub struct DualRetrieval {
    pub process: Vec<RetrievedExchange>,
    pub episodic: Vec<RetrievedExchange>,
}

impl DualRetrieval {
    pub fn is_empty(&self) -> bool {
        self.process.is_empty() && self.episodic.is_empty()
    }
}

/// Per-call knobs; tenants override them through their config row.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalTuning {
    pub process_top_k: usize,
    pub episodic_top_k: usize,
    pub process_min_score: f32,
    pub query_timeout: Duration,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            process_top_k: 5,
            episodic_top_k: 8,
            process_min_score: 0.5,
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// One retrieval pass over both memory lanes.
///
/// The scope gate precedes everything; an empty scope yields an empty
/// result without touching the store. A missing embedding empties the
/// process lane while the episodic lane runs keyword-only.
#[instrument(skip_all, fields(user_id = ?scope.user_id, tenant_id = ?scope.tenant_id))]
pub async fn retrieve(
    db: &SurrealDbClient,
    scope: &MemoryScope,
    input_text: &str,
    query_embedding: Option<&[f32]>,
    timeframe: Option<TimeRange>,
    tuning: RetrievalTuning,
) -> Result<DualRetrieval, AppError> {
    if scope.is_empty() {
        return Ok(DualRetrieval::default());
    }

    let process = tokio::time::timeout(
        tuning.query_timeout,
        process_lane_scoped(db, scope, query_embedding, tuning),
    );
    let episodic = tokio::time::timeout(
        tuning.query_timeout,
        episodic::episodic_lane(
            db,
            scope,
            input_text,
            query_embedding,
            tuning.episodic_top_k,
            timeframe,
        ),
    );

    let (process, episodic) = tokio::join!(process, episodic);

    Ok(DualRetrieval {
        process: process.map_err(|_| AppError::Deadline)??,
        episodic: episodic.map_err(|_| AppError::Deadline)??,
    })
}

async fn process_lane_scoped(
    db: &SurrealDbClient,
    scope: &MemoryScope,
    query_embedding: Option<&[f32]>,
    tuning: RetrievalTuning,
) -> Result<Vec<RetrievedExchange>, AppError> {
    process::process_lane(
        db,
        scope,
        query_embedding,
        tuning.process_top_k,
        tuning.process_min_score,
    )
    .await
}
