use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{
        db::SurrealDbClient,
        types::analytics::Analytics,
        types::exchange::{Exchange, ExchangeFlags, ExchangeSource},
        types::system_settings::{SystemSettings, DEFAULT_PERSONA},
        types::tenant_config::{HotContextMode, TenantConfig},
    },
    utils::{
        embedding::EmbeddingClient,
        llm::{LanguageModel, LmRequest},
    },
};
use memory_pipeline::{MemoryPipeline, TurnOutput};
use retrieval_pipeline::{
    retrieve, search_documents, DocumentQuery, DualRetrieval, RetrievalTuning,
};

use crate::actions::{parse_action_tags, ActionTag};
use crate::phase::{PhaseTracker, TurnSignal};
use crate::prompt::{assemble_system_prompt, ContextSnippet, PromptInputs, TrustTier};
use crate::tools::{
    execute_tools, parse_tool_calls, synthesis_prompt, MarkerStripper, ToolContext,
};

use super::{CognitiveState, ThinkChunk, TurnRequest};

/// How far back the proactive hot-context pull reaches.
const HOT_CONTEXT_WINDOW_MIN: i64 = 60;
/// How many recent exchanges the hot-context pull injects.
const HOT_CONTEXT_LIMIT: usize = 5;
/// How many session-buffer hits feed the prompt.
const SESSION_CONTEXT_LIMIT: usize = 5;

/// Shared process-wide collaborators, constructed once at startup.
#[derive(Clone)]
pub struct EngineDeps {
    pub db: Arc<SurrealDbClient>,
    pub lm: Arc<dyn LanguageModel>,
    pub embedder: Arc<EmbeddingClient>,
    pub pipeline: Arc<MemoryPipeline>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    pub llm_idle: Duration,
    pub synthesis: Duration,
    pub store_query: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            llm_idle: Duration::from_secs(45),
            synthesis: Duration::from_secs(30),
            store_query: Duration::from_secs(5),
        }
    }
}

/// The think-loop state machine, shared by both twin variants.
pub struct ThinkEngine {
    deps: EngineDeps,
    tenant: TenantConfig,
    timeouts: EngineTimeouts,
    document_first: bool,
    phases: Mutex<HashMap<String, PhaseTracker>>,
}

impl ThinkEngine {
    pub fn new(
        deps: EngineDeps,
        tenant: TenantConfig,
        timeouts: EngineTimeouts,
        document_first: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            tenant,
            timeouts,
            document_first,
            phases: Mutex::new(HashMap::new()),
        })
    }

    /// Entry point used by the variants: fail-secure gate, then the turn
    /// runs on its own task feeding the returned channel.
    pub fn spawn_turn(
        self: Arc<Self>,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<ThinkChunk>, AppError> {
        if request.scope.is_empty() {
            return Err(AppError::Scope("verify required before message".into()));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.run_turn(tx, request).await;
        });
        Ok(rx)
    }

    #[instrument(skip_all, fields(session_id = %request.session_id))]
    async fn run_turn(&self, tx: mpsc::Sender<ThinkChunk>, request: TurnRequest) {
        let cancel = request.cancel.clone();
        let scope = request.scope.clone();

        // PHASE: read before the turn mutates the window.
        let phase = {
            let mut phases = match self.phases.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            phases
                .entry(request.session_id.clone())
                .or_default()
                .current()
        };

        let settings = match SystemSettings::get_current(&self.deps.db).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(error = %err, "system settings unavailable, using defaults");
                SystemSettings {
                    id: "current".into(),
                    chat_model: "gpt-4o-mini".into(),
                    synthesis_model: "gpt-4o-mini".into(),
                    embedding_model: "text-embedding-3-large".into(),
                    embedding_dimensions: self.deps.embedder.dimension() as u32,
                    default_persona: DEFAULT_PERSONA.into(),
                }
            }
        };

        // RETRIEVE: embedding failure degrades to keyword-only.
        let embedding = tokio::select! {
            () = cancel.cancelled() => return,
            result = self.deps.embedder.embed(&request.input) => match result {
                Ok(vector) => Some(vector),
                Err(err) => {
                    warn!(error = %err, "input embedding failed, degrading to keyword-only");
                    None
                }
            },
        };

        let (snippets, retrieved_count, best_score) = self
            .gather_context(&request, &scope, embedding.as_deref())
            .await;

        // PROMPT
        let persona = if self.tenant.persona.trim().is_empty() {
            settings.default_persona.as_str()
        } else {
            self.tenant.persona.as_str()
        };
        let system = assemble_system_prompt(&PromptInputs {
            persona,
            instructions: &self.tenant.instructions,
            phase,
            snippets: &snippets,
            document_first: self.document_first,
        });

        // STREAM
        let stream = tokio::select! {
            () = cancel.cancelled() => return,
            result = self.deps.lm.stream_chat(LmRequest {
                model: settings.chat_model.clone(),
                system,
                user: request.input.clone(),
            }) => result,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "LLM stream failed to open");
                let _ = tx
                    .send(ThinkChunk::Error {
                        code: "upstream_partial",
                        message: "language model unavailable".into(),
                    })
                    .await;
                self.observe_phase(&request.session_id, retrieved_count, best_score, true);
                return;
            }
        };

        let mut raw_text = String::new();
        let mut visible_text = String::new();
        let mut stripper = MarkerStripper::default();
        let mut partial = false;
        let mut errored = false;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    partial = true;
                    break;
                }
                next = tokio::time::timeout(self.timeouts.llm_idle, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!("LLM stream idle timeout");
                    let _ = tx
                        .send(ThinkChunk::Error {
                            code: "upstream_partial",
                            message: "language model stream stalled".into(),
                        })
                        .await;
                    partial = true;
                    errored = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    warn!(error = %err, "LLM stream error mid-response");
                    let _ = tx
                        .send(ThinkChunk::Error {
                            code: "upstream_partial",
                            message: "language model stream failed".into(),
                        })
                        .await;
                    partial = true;
                    errored = true;
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    raw_text.push_str(&chunk);
                    let clean = stripper.push(&chunk);
                    if !clean.is_empty() {
                        visible_text.push_str(&clean);
                        if tx.send(ThinkChunk::Content(clean)).await.is_err() {
                            // Receiver gone: the connection closed under us.
                            partial = true;
                            break;
                        }
                    }
                }
            }
        }

        if !partial {
            let tail = stripper.finish();
            if !tail.is_empty() {
                visible_text.push_str(&tail);
                let _ = tx.send(ThinkChunk::Content(tail)).await;
            }
        }

        // DETECT + synthesis. Skipped entirely for cut-short turns.
        let mut tools_used: Vec<String> = Vec::new();
        let mut final_text = visible_text.clone();
        if !partial {
            let calls = parse_tool_calls(&raw_text);
            if calls.is_empty() {
                let _ = tx
                    .send(ThinkChunk::Meta(CognitiveState {
                        phase: phase.to_string(),
                        tools_used: Vec::new(),
                    }))
                    .await;
            } else {
                let ctx = ToolContext {
                    db: Arc::clone(&self.deps.db),
                    pipeline: Arc::clone(&self.deps.pipeline),
                    embedder: Arc::clone(&self.deps.embedder),
                    scope: scope.clone(),
                    session_id: request.session_id.clone(),
                    tuning: self.retrieval_tuning(),
                };

                match execute_tools(&ctx, calls, &cancel).await {
                    Err(_) => partial = true,
                    Ok(outcome) => {
                        tools_used = outcome.tools_used();
                        info!(tools = ?tools_used, "tool markers executed");
                        let _ = tx
                            .send(ThinkChunk::Meta(CognitiveState {
                                phase: phase.to_string(),
                                tools_used: tools_used.clone(),
                            }))
                            .await;

                        // One synthesis call, and only when a tool actually
                        // returned something.
                        if outcome.has_results() {
                            let touched = outcome.exchange_ids();
                            if let Err(err) = Exchange::touch(&touched, &self.deps.db).await {
                                debug!(error = %err, "touch after tool recall failed");
                            }

                            let prompt =
                                synthesis_prompt(&request.input, &visible_text, &outcome);
                            let synthesis = tokio::select! {
                                () = cancel.cancelled() => {
                                    partial = true;
                                    None
                                }
                                result = tokio::time::timeout(
                                    self.timeouts.synthesis,
                                    self.deps.lm.complete(LmRequest {
                                        model: settings.synthesis_model.clone(),
                                        system: persona.to_string(),
                                        user: prompt,
                                    }),
                                ) => match result {
                                    Ok(Ok(text)) => Some(text),
                                    Ok(Err(err)) => {
                                        warn!(error = %err, "synthesis call failed, keeping draft");
                                        errored = true;
                                        None
                                    }
                                    Err(_) => {
                                        warn!("synthesis call timed out, keeping draft");
                                        errored = true;
                                        None
                                    }
                                },
                            };

                            if let Some(text) = synthesis {
                                let mut cleaner = MarkerStripper::default();
                                let mut clean = cleaner.push(&text);
                                clean.push_str(&cleaner.finish());
                                raw_text.push_str(&text);
                                if !clean.is_empty() {
                                    final_text.push_str("\n\n");
                                    final_text.push_str(&clean);
                                    let _ = tx
                                        .send(ThinkChunk::Content(format!("\n\n{clean}")))
                                        .await;
                                }
                            }
                        }
                    }
                }
            }
        }

        // PARSE ACTIONS
        let mut flags = ExchangeFlags {
            partial,
            has_code: request.input.contains("```") || final_text.contains("```"),
            has_error: errored,
            ..ExchangeFlags::default()
        };
        let mut tags: HashMap<String, String> = HashMap::new();
        for (i, action) in parse_action_tags(&raw_text).into_iter().enumerate() {
            match action {
                ActionTag::Remember { note } => {
                    tags.insert(format!("remember_{i}"), note);
                }
                ActionTag::Reflect { topic } => {
                    tags.insert(format!("reflect_{i}"), topic);
                }
                ActionTag::Escalate { reason } => {
                    flags.action_required = true;
                    tags.insert(format!("escalate_{i}"), reason);
                }
            }
        }

        // INGEST: anything the user saw goes to memory, partial included.
        if !final_text.is_empty() {
            let output = TurnOutput {
                session_id: request.session_id.clone(),
                user_id: scope.user_id.clone(),
                tenant_id: scope.tenant_id.clone(),
                human_content: request.input.clone(),
                assistant_content: final_text,
                source: ExchangeSource::Chat,
                intent_type: None,
                flags,
                tags,
            };
            if let Err(err) = self.deps.pipeline.ingest(output) {
                warn!(error = %err, "exchange ingest failed");
            }
            if let Err(err) = Analytics::record_turn(&self.deps.db, tools_used.len()).await {
                debug!(error = %err, "analytics update failed");
            }
        }

        // RECORD PHASE
        self.observe_phase(
            &request.session_id,
            retrieved_count,
            best_score,
            partial || errored,
        );
    }

    /// RETRIEVE: session buffer, optional hot context, both retriever lanes
    /// and (for document-first twins) the smart-RAG store.
    async fn gather_context(
        &self,
        request: &TurnRequest,
        scope: &MemoryScope,
        embedding: Option<&[f32]>,
    ) -> (Vec<ContextSnippet>, usize, f32) {
        let mut snippets = Vec::new();
        let mut best_score = 0.0f32;

        // Same-session buffer: the freshest memory there is.
        if let Some(embedding) = embedding {
            let hits = self
                .deps
                .pipeline
                .search_session(
                    scope,
                    Some(&request.session_id),
                    embedding,
                    SESSION_CONTEXT_LIMIT,
                    self.tenant.session_min_score,
                )
                .await;
            for (exchange, score) in hits {
                best_score = best_score.max(score);
                snippets.push(ContextSnippet {
                    tier: TrustTier::Session,
                    text: render_exchange(&exchange),
                });
            }
        }

        // Proactive hot-context pull, per tenant policy.
        let hot_context = match self.tenant.hot_context {
            HotContextMode::Always => true,
            HotContextMode::Stale => self.deps.pipeline.is_stale(),
            HotContextMode::Never => false,
        };
        if hot_context {
            let since = Utc::now() - ChronoDuration::minutes(HOT_CONTEXT_WINDOW_MIN);
            match Exchange::recent(scope, Some(since), None, HOT_CONTEXT_LIMIT, &self.deps.db)
                .await
            {
                Ok(recent) => {
                    for exchange in recent {
                        snippets.push(ContextSnippet {
                            tier: TrustTier::HotTemporal,
                            text: render_exchange(&exchange),
                        });
                    }
                }
                Err(err) => warn!(error = %err, "hot context pull failed"),
            }
        }

        // Dual retriever.
        let dual = match retrieve(
            &self.deps.db,
            scope,
            &request.input,
            embedding,
            None,
            self.retrieval_tuning(),
        )
        .await
        {
            Ok(dual) => dual,
            Err(err) => {
                warn!(error = %err, "retrieval failed, continuing without memory");
                DualRetrieval::default()
            }
        };
        let retrieved_count = dual.process.len() + dual.episodic.len();

        let episodic_tier = if embedding.is_some() {
            TrustTier::Episodic
        } else {
            TrustTier::Keyword
        };
        for hit in &dual.episodic {
            best_score = best_score.max(hit.score);
            snippets.push(ContextSnippet {
                tier: episodic_tier,
                text: render_exchange(&hit.exchange),
            });
        }
        for hit in &dual.process {
            best_score = best_score.max(hit.score);
            snippets.push(ContextSnippet {
                tier: TrustTier::ProcessVector,
                text: render_exchange(&hit.exchange),
            });
        }

        // Document-first twins consult the smart-RAG store up front.
        if self.document_first {
            if let Some(tenant_id) = scope.tenant_id.clone() {
                let query = DocumentQuery {
                    embedding: embedding.map(<[f32]>::to_vec),
                    tenant_id,
                    allowed_departments: scope.departments.clone(),
                    intent: None,
                    entities: Vec::new(),
                    verbs: Vec::new(),
                    threshold: self.tenant.document_threshold,
                    safety_cap: 200,
                };
                match search_documents(&self.deps.db, query).await {
                    Ok(documents) => {
                        for document in documents {
                            best_score = best_score.max(document.score);
                            snippets.push(ContextSnippet {
                                tier: TrustTier::Document,
                                text: format!(
                                    "{} — {}",
                                    document.chunk.section_title, document.chunk.content
                                ),
                            });
                        }
                    }
                    Err(err) => warn!(error = %err, "document retrieval failed"),
                }
            }
        }

        (snippets, retrieved_count, best_score)
    }

    fn retrieval_tuning(&self) -> RetrievalTuning {
        RetrievalTuning {
            process_top_k: self.tenant.process_top_k,
            episodic_top_k: self.tenant.episodic_top_k,
            process_min_score: self.tenant.session_min_score,
            query_timeout: self.timeouts.store_query,
        }
    }

    fn observe_phase(&self, session_id: &str, retrieved: usize, best_score: f32, errored: bool) {
        let mut phases = match self.phases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        phases
            .entry(session_id.to_string())
            .or_default()
            .observe(TurnSignal {
                retrieved,
                best_score,
                errored,
            });
    }
}

fn render_exchange(exchange: &Exchange) -> String {
    format!(
        "({}) user: {} | assistant: {}",
        exchange.created_at.format("%Y-%m-%d %H:%M"),
        exchange.human_content,
        exchange.assistant_content,
    )
}
