pub mod buffer;
pub mod cluster;

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{
        db::SurrealDbClient,
        types::exchange::{Exchange, ExchangeFlags, ExchangeSource},
        types::session::SessionRecord,
    },
    utils::embedding::EmbeddingClient,
};

use buffer::SessionBuffer;
use cluster::{ClusterEngine, NOISE_CLUSTER};

/// Batch knobs for the ingest worker.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub batch_max: usize,
    pub flush_interval: Duration,
    pub cluster_tau: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max: 10,
            flush_interval: Duration::from_secs(5),
            cluster_tau: 0.83,
        }
    }
}

/// One completed turn handed to `ingest`. The queue owns it from there until
/// the batch commits.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub session_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub human_content: String,
    pub assistant_content: String,
    pub source: ExchangeSource,
    pub intent_type: Option<String>,
    pub flags: ExchangeFlags,
    pub tags: HashMap<String, String>,
}

impl TurnOutput {
    fn materialize(&self) -> Exchange {
        let mut exchange = Exchange::new(
            self.session_id.clone(),
            self.user_id.clone(),
            self.tenant_id.clone(),
            self.human_content.clone(),
            self.assistant_content.clone(),
            self.source,
        );
        exchange.intent_type = self.intent_type.clone();
        exchange.flags = self.flags;
        exchange.tags = self.tags.clone();
        exchange
    }
}

/// The async batched memory-ingest pipeline.
///
/// `ingest` returns as soon as the output is queued. A single worker task
/// accumulates batches (timeout or batch-full), embeds them, assigns
/// clusters, publishes to the in-process session buffer and finally writes
/// through to the durable store. Published batches are visible to
/// `search_session` before the durable write lands.
pub struct MemoryPipeline {
    queue: mpsc::UnboundedSender<TurnOutput>,
    buffer: Arc<RwLock<SessionBuffer>>,
    last_publish: Arc<StdRwLock<Option<Instant>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: PipelineConfig,
}

impl MemoryPipeline {
    pub fn start(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingClient>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(RwLock::new(SessionBuffer::default()));
        let last_publish = Arc::new(StdRwLock::new(None));
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(worker_loop(
            rx,
            db,
            embedder,
            Arc::clone(&buffer),
            Arc::clone(&last_publish),
            shutdown.clone(),
            config,
        ));

        Arc::new(Self {
            queue: tx,
            buffer,
            last_publish,
            shutdown,
            worker: Mutex::new(Some(worker)),
            config,
        })
    }

    /// Enqueue a completed turn. Returns immediately; the worker does the
    /// rest.
    pub fn ingest(&self, output: TurnOutput) -> Result<(), AppError> {
        self.queue
            .send(output)
            .map_err(|_| AppError::Internal("ingest pipeline is stopped".into()))
    }

    /// Cosine scan over the published session buffer.
    pub async fn search_session(
        &self,
        scope: &MemoryScope,
        session_id: Option<&str>,
        query_embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Vec<(Exchange, f32)> {
        self.buffer
            .read()
            .await
            .search(scope, session_id, query_embedding, top_k, min_score)
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.read().await.len()
    }

    /// Whether the buffer has published recently. Drives the hot-context
    /// auto-injection decision.
    pub fn is_stale(&self) -> bool {
        match self.last_publish.read() {
            Ok(guard) => match *guard {
                Some(at) => at.elapsed() > self.config.flush_interval,
                None => true,
            },
            Err(_) => true,
        }
    }

    /// Stop the worker, draining the queue and flushing durably.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "ingest worker did not stop cleanly");
            }
        }
    }
}

#[allow(clippy::missing_docs_in_private_items)]
async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<TurnOutput>,
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingClient>,
    buffer: Arc<RwLock<SessionBuffer>>,
    last_publish: Arc<StdRwLock<Option<Instant>>>,
    shutdown: CancellationToken,
    config: PipelineConfig,
) {
    let mut clusters = ClusterEngine::new(config.cluster_tau);
    let mut pending_durable: Vec<(Exchange, Option<Vec<f32>>)> = Vec::new();

    info!(
        batch_max = config.batch_max,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "memory ingest worker started"
    );

    'outer: loop {
        let mut batch: Vec<TurnOutput> = Vec::new();

        tokio::select! {
            item = rx.recv() => match item {
                Some(output) => batch.push(output),
                None => break 'outer,
            },
            () = shutdown.cancelled() => break 'outer,
        }

        let deadline = tokio::time::Instant::now() + config.flush_interval;
        while batch.len() < config.batch_max {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(output) => batch.push(output),
                    None => break,
                },
                () = tokio::time::sleep_until(deadline) => break,
                () = shutdown.cancelled() => break,
            }
        }

        flush_batch(
            batch,
            &db,
            &embedder,
            &buffer,
            &last_publish,
            &mut clusters,
            &mut pending_durable,
        )
        .await;

        if shutdown.is_cancelled() {
            break;
        }
    }

    // Shutdown drain: whatever is still queued gets one final batch.
    let mut rest = Vec::new();
    while let Ok(output) = rx.try_recv() {
        rest.push(output);
    }
    if !rest.is_empty() {
        flush_batch(
            rest,
            &db,
            &embedder,
            &buffer,
            &last_publish,
            &mut clusters,
            &mut pending_durable,
        )
        .await;
    }
    retry_pending(&db, &mut pending_durable).await;

    info!("memory ingest worker stopped");
}

/// One batch through the stage machine: EMBEDDING -> CLUSTERING ->
/// PUBLISHING -> DURABLE-WRITE.
#[allow(clippy::missing_docs_in_private_items)]
async fn flush_batch(
    batch: Vec<TurnOutput>,
    db: &SurrealDbClient,
    embedder: &EmbeddingClient,
    buffer: &RwLock<SessionBuffer>,
    last_publish: &StdRwLock<Option<Instant>>,
    clusters: &mut ClusterEngine,
    pending_durable: &mut Vec<(Exchange, Option<Vec<f32>>)>,
) {
    if batch.is_empty() {
        return;
    }

    // EMBEDDING. A failed batch keeps its items, just without vectors.
    let texts: Vec<String> = batch
        .iter()
        .map(|output| format!("{}\n{}", output.human_content, output.assistant_content))
        .collect();
    let embeddings: Vec<Option<Vec<f32>>> = match embedder.embed_batch(&texts).await {
        Ok(vectors) => vectors.into_iter().map(Some).collect(),
        Err(err) => {
            warn!(error = %err, "batch embedding failed, continuing with nil embeddings");
            vec![None; batch.len()]
        }
    };

    // CLUSTERING + sequence stamping + materialization.
    let mut rows: Vec<(String, Option<Vec<f32>>, Exchange)> = Vec::with_capacity(batch.len());
    for (output, embedding) in batch.into_iter().zip(embeddings) {
        let sequence = match SessionRecord::next_sequence(&output.session_id, db).await {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(error = %err, session_id = %output.session_id, "sequence stamp failed");
                -1
            }
        };

        let (cluster_id, confidence) = match &embedding {
            Some(vector) => clusters.assign(vector),
            None => (NOISE_CLUSTER, 0.0),
        };

        let mut exchange = output.materialize();
        exchange.sequence_index = sequence;
        exchange.cluster_id = cluster_id;
        exchange.cluster_confidence = confidence;

        rows.push((output.assistant_content, embedding, exchange));
    }

    // PUBLISHING: one write guard, so readers see the whole batch or none
    // of it. From here the outputs are retrievable by the next turn.
    {
        let mut guard = buffer.write().await;
        guard.append_batch(rows.clone());
    }
    if let Ok(mut stamp) = last_publish.write() {
        *stamp = Some(Instant::now());
    }
    debug!(published = rows.len(), "session buffer batch published");

    // DURABLE-WRITE, with backoff. Failures stay buffered for retry; the
    // in-memory copy above remains searchable either way.
    for (_, embedding, exchange) in rows {
        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
        let result = Retry::spawn(strategy, || {
            Exchange::record(exchange.clone(), embedding.clone(), db)
        })
        .await;

        if let Err(err) = result {
            warn!(error = %err, exchange_id = %exchange.id, "durable write failed, retaining for retry");
            pending_durable.push((exchange, embedding));
        }
    }

    retry_pending(db, pending_durable).await;
}

#[allow(clippy::missing_docs_in_private_items)]
async fn retry_pending(db: &SurrealDbClient, pending_durable: &mut Vec<(Exchange, Option<Vec<f32>>)>) {
    if pending_durable.is_empty() {
        return;
    }
    let mut still_pending = Vec::new();
    for (exchange, embedding) in pending_durable.drain(..) {
        match Exchange::record(exchange.clone(), embedding.clone(), db).await {
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, exchange_id = %exchange.id, "durable retry failed");
                still_pending.push((exchange, embedding));
            }
        }
    }
    *pending_durable = still_pending;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup() -> (Arc<SurrealDbClient>, Arc<EmbeddingClient>) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(16).await.expect("init");
        let embedder = Arc::new(EmbeddingClient::hashed(16).expect("embedder"));
        (db, embedder)
    }

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            batch_max: 10,
            flush_interval: Duration::from_millis(50),
            cluster_tau: 0.83,
        }
    }

    fn output(session: &str, user: &str, human: &str, assistant: &str) -> TurnOutput {
        TurnOutput {
            session_id: session.to_string(),
            user_id: Some(user.to_string()),
            tenant_id: None,
            human_content: human.to_string(),
            assistant_content: assistant.to_string(),
            source: ExchangeSource::Chat,
            intent_type: None,
            flags: ExchangeFlags::default(),
            tags: HashMap::new(),
        }
    }

    async fn wait_for_buffered(pipeline: &MemoryPipeline, count: usize) {
        for _ in 0..100 {
            if pipeline.buffered().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pipeline never published {count} items");
    }

    #[tokio::test]
    async fn ingested_output_becomes_searchable_by_the_next_turn() {
        let (db, embedder) = setup().await;
        let pipeline = MemoryPipeline::start(Arc::clone(&db), Arc::clone(&embedder), fast_config());

        pipeline
            .ingest(output("s1", "u1", "my favorite color is indigo", "noted, indigo"))
            .expect("ingest");

        wait_for_buffered(&pipeline, 1).await;

        let query = embedder
            .embed("what color did I mention")
            .await
            .expect("embed query");
        // The hashed backend shares the "color" token, enough to clear a low floor.
        let hits = pipeline
            .search_session(&MemoryScope::for_user("u1"), Some("s1"), &query, 5, 0.05)
            .await;

        assert!(!hits.is_empty(), "published output must be retrievable");
        assert!(hits[0].0.human_content.contains("indigo"));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn batch_full_flushes_without_waiting_for_the_timer() {
        let (db, embedder) = setup().await;
        let config = PipelineConfig {
            batch_max: 2,
            flush_interval: Duration::from_secs(3600),
            cluster_tau: 0.83,
        };
        let pipeline = MemoryPipeline::start(Arc::clone(&db), embedder, config);

        pipeline.ingest(output("s1", "u1", "one", "first")).expect("ingest");
        pipeline.ingest(output("s1", "u1", "two", "second")).expect("ingest");

        wait_for_buffered(&pipeline, 2).await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn search_session_respects_scope() {
        let (db, embedder) = setup().await;
        let pipeline = MemoryPipeline::start(Arc::clone(&db), Arc::clone(&embedder), fast_config());

        pipeline
            .ingest(output("s1", "u1", "private to user one", "ok"))
            .expect("ingest");
        wait_for_buffered(&pipeline, 1).await;

        let query = embedder.embed("private to user one").await.expect("embed");
        let foreign = pipeline
            .search_session(&MemoryScope::for_user("u2"), None, &query, 5, 0.0)
            .await;
        assert!(foreign.is_empty());

        let empty_scope = pipeline
            .search_session(&MemoryScope::default(), None, &query, 5, 0.0)
            .await;
        assert!(empty_scope.is_empty());

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn sequence_indexes_increase_across_batches() {
        let (db, embedder) = setup().await;
        let pipeline = MemoryPipeline::start(Arc::clone(&db), embedder, fast_config());

        for i in 0..3 {
            pipeline
                .ingest(output("s1", "u1", &format!("turn {i}"), "reply"))
                .expect("ingest");
            wait_for_buffered(&pipeline, i + 1).await;
        }
        pipeline.stop().await;

        let scope = MemoryScope::for_user("u1");
        let mut rows = Exchange::recent(&scope, None, None, 10, &db)
            .await
            .expect("recent");
        rows.sort_by_key(|e| e.sequence_index);
        let indexes: Vec<i64> = rows.iter().map(|e| e.sequence_index).collect();
        assert_eq!(indexes.len(), 3);
        for pair in indexes.windows(2) {
            assert!(pair[1] > pair[0], "expected increasing sequence, got {indexes:?}");
        }
    }

    #[tokio::test]
    async fn stop_flushes_queued_items_durably() {
        let (db, embedder) = setup().await;
        let config = PipelineConfig {
            batch_max: 100,
            flush_interval: Duration::from_secs(3600),
            cluster_tau: 0.83,
        };
        let pipeline = MemoryPipeline::start(Arc::clone(&db), embedder, config);

        pipeline
            .ingest(output("s1", "u1", "about to shut down", "bye"))
            .expect("ingest");
        pipeline.stop().await;

        let rows = Exchange::recent(&MemoryScope::for_user("u1"), None, None, 10, &db)
            .await
            .expect("recent");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].human_content, "about to shut down");
    }

    #[tokio::test]
    async fn is_stale_until_first_publish() {
        let (db, embedder) = setup().await;
        let pipeline = MemoryPipeline::start(Arc::clone(&db), embedder, fast_config());

        assert!(pipeline.is_stale(), "no batch published yet");

        pipeline
            .ingest(output("s1", "u1", "warm the buffer", "done"))
            .expect("ingest");
        wait_for_buffered(&pipeline, 1).await;
        assert!(!pipeline.is_stale(), "fresh publish must not be stale");

        pipeline.stop().await;
    }
}
