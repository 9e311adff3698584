use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{db::SurrealDbClient, types::exchange::Exchange},
    utils::embedding::EmbeddingClient,
};
use memory_pipeline::MemoryPipeline;
use retrieval_pipeline::{
    episodic::episodic_lane, parse_timeframe, process::process_lane, RetrievalTuning,
    RetrievedExchange,
};

use super::{ToolCall, ToolKind};

/// Default window for SQUIRREL when the model names none.
const SQUIRREL_DEFAULT_TIMEFRAME: &str = "-60min";
/// Default recall depth for SQUIRREL's `back` argument.
const SQUIRREL_DEFAULT_BACK: usize = 10;
/// Content preview length in tool-result lines.
const PREVIEW_CHARS: usize = 160;

/// Everything a tool invocation needs, scoped to one turn.
#[derive(Clone)]
pub struct ToolContext {
    pub db: Arc<SurrealDbClient>,
    pub pipeline: Arc<MemoryPipeline>,
    pub embedder: Arc<EmbeddingClient>,
    pub scope: MemoryScope,
    pub session_id: String,
    pub tuning: RetrievalTuning,
}

/// One retrieved line plus the exchange id it came from (when it came from
/// an exchange at all), kept separate so dedupe can work on ids.
#[derive(Debug, Clone)]
pub struct ToolHit {
    pub exchange_id: Option<String>,
    pub line: String,
}

/// Result of one tool invocation.
#[derive(Debug)]
pub struct ToolSection {
    pub kind: ToolKind,
    pub result: Result<Vec<ToolHit>, AppError>,
    pub latency_ms: u64,
}

/// All sections of one turn, already deduped and in fixed kind order.
#[derive(Debug, Default)]
pub struct ToolOutcome {
    pub sections: Vec<ToolSection>,
}

impl ToolOutcome {
    /// Labels of the tools that ran, in presentation order.
    pub fn tools_used(&self) -> Vec<String> {
        self.sections
            .iter()
            .map(|section| section.kind.label().to_string())
            .collect()
    }

    /// Whether any tool produced at least one hit. Gates the synthesis call.
    pub fn has_results(&self) -> bool {
        self.sections
            .iter()
            .any(|section| matches!(&section.result, Ok(hits) if !hits.is_empty()))
    }

    /// Ids of every exchange any tool surfaced.
    pub fn exchange_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for section in &self.sections {
            if let Ok(hits) = &section.result {
                for hit in hits {
                    if let Some(id) = &hit.exchange_id {
                        ids.push(id.clone());
                    }
                }
            }
        }
        ids
    }
}

/// Run every detected tool concurrently under the turn's cancellation token.
///
/// Sections come back keyed and ordered by kind, not by completion order,
/// so retries see identical synthesis prompts. A single failing tool turns
/// into a failed section; the others proceed.
pub async fn execute_tools(
    ctx: &ToolContext,
    calls: Vec<ToolCall>,
    cancel: &CancellationToken,
) -> Result<ToolOutcome, AppError> {
    if calls.is_empty() {
        return Ok(ToolOutcome::default());
    }

    let futures: Vec<_> = calls
        .into_iter()
        .map(|call| {
            let ctx = ctx.clone();
            async move {
                let kind = call.kind();
                let started = Instant::now();
                let result = run_call(&ctx, call).await;
                if let Err(err) = &result {
                    warn!(tool = kind.label(), error = %err, "tool invocation failed");
                }
                ToolSection {
                    kind,
                    result,
                    latency_ms: started.elapsed().as_millis() as u64,
                }
            }
        })
        .collect();

    let mut sections = tokio::select! {
        sections = join_all(futures) => sections,
        () = cancel.cancelled() => {
            debug!("tool execution cancelled");
            return Err(AppError::Internal("turn cancelled during tool execution".into()));
        }
    };

    sections.sort_by_key(|section| section.kind);

    // GREP reports first; the dense lanes never repeat its ids.
    let mut seen_exchange_ids: HashSet<String> = HashSet::new();
    for section in &sections {
        if section.kind == ToolKind::Grep {
            if let Ok(hits) = &section.result {
                seen_exchange_ids.extend(hits.iter().filter_map(|hit| hit.exchange_id.clone()));
            }
        }
    }
    for section in &mut sections {
        if matches!(section.kind, ToolKind::Vector | ToolKind::Episodic) {
            if let Ok(hits) = &mut section.result {
                hits.retain(|hit| {
                    hit.exchange_id
                        .as_ref()
                        .is_none_or(|id| !seen_exchange_ids.contains(id))
                });
            }
        }
    }

    Ok(ToolOutcome { sections })
}

#[allow(clippy::missing_docs_in_private_items)]
async fn run_call(ctx: &ToolContext, call: ToolCall) -> Result<Vec<ToolHit>, AppError> {
    match call {
        ToolCall::Grep { term } => {
            let hits = episodic_lane(
                &ctx.db,
                &ctx.scope,
                &term,
                None,
                ctx.tuning.episodic_top_k,
                None,
            )
            .await
            .map_err(|e| AppError::ToolExecution(format!("GREP failed: {e}")))?;
            Ok(hits.iter().map(exchange_hit).collect())
        }
        ToolCall::Squirrel {
            timeframe,
            back,
            search,
        } => {
            let window = parse_timeframe(
                timeframe.as_deref().unwrap_or(SQUIRREL_DEFAULT_TIMEFRAME),
                Utc::now(),
            )?;
            let limit = back.unwrap_or(SQUIRREL_DEFAULT_BACK);

            let exchanges = match search {
                Some(terms) => Exchange::fts_search(
                    limit,
                    &terms,
                    &ctx.scope,
                    window.from,
                    window.to,
                    &ctx.db,
                )
                .await
                .map_err(|e| AppError::ToolExecution(format!("SQUIRREL failed: {e}")))?
                .into_iter()
                .map(|hit| hit.exchange)
                .collect::<Vec<_>>(),
                None => Exchange::recent(&ctx.scope, window.from, window.to, limit, &ctx.db)
                    .await
                    .map_err(|e| AppError::ToolExecution(format!("SQUIRREL failed: {e}")))?,
            };

            Ok(exchanges
                .iter()
                .map(|exchange| ToolHit {
                    exchange_id: Some(exchange.id.clone()),
                    line: format_exchange(exchange),
                })
                .collect())
        }
        ToolCall::Vector { query } => {
            let embedding = ctx
                .embedder
                .embed(&query)
                .await
                .map_err(|e| AppError::ToolExecution(format!("VECTOR embedding failed: {e}")))?;
            let hits = process_lane(
                &ctx.db,
                &ctx.scope,
                Some(&embedding),
                ctx.tuning.process_top_k,
                ctx.tuning.process_min_score,
            )
            .await
            .map_err(|e| AppError::ToolExecution(format!("VECTOR failed: {e}")))?;
            Ok(hits.iter().map(exchange_hit).collect())
        }
        ToolCall::Episodic { query, timeframe } => {
            let window = timeframe
                .as_deref()
                .map(|raw| parse_timeframe(raw, Utc::now()))
                .transpose()?;
            // Keyword-only degradation when the embedding service is down.
            let embedding = match ctx.embedder.embed(&query).await {
                Ok(vector) => Some(vector),
                Err(err) => {
                    warn!(error = %err, "EPISODIC embedding failed, running keyword-only");
                    None
                }
            };
            let hits = episodic_lane(
                &ctx.db,
                &ctx.scope,
                &query,
                embedding.as_deref(),
                ctx.tuning.episodic_top_k,
                window,
            )
            .await
            .map_err(|e| AppError::ToolExecution(format!("EPISODIC failed: {e}")))?;
            Ok(hits.iter().map(exchange_hit).collect())
        }
    }
}

fn exchange_hit(hit: &RetrievedExchange) -> ToolHit {
    ToolHit {
        exchange_id: Some(hit.exchange.id.clone()),
        line: format_exchange(&hit.exchange),
    }
}

fn format_exchange(exchange: &Exchange) -> String {
    format!(
        "({}) user: {} | assistant: {}",
        exchange.created_at.format("%Y-%m-%d %H:%M"),
        preview(&exchange.human_content),
        preview(&exchange.assistant_content),
    )
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        content.to_string()
    } else {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}…")
    }
}

/// Build the single synthesis prompt: the user's question, the draft the
/// model produced, and every tool section in fixed order. Failed tools are
/// declared unavailable rather than silently dropped.
pub fn synthesis_prompt(user_query: &str, draft: &str, outcome: &ToolOutcome) -> String {
    let mut results_block = String::new();
    for section in &outcome.sections {
        results_block.push_str(&format!("### {}\n", section.kind.label()));
        match &section.result {
            Ok(hits) if hits.is_empty() => results_block.push_str("(no results)\n"),
            Ok(hits) => {
                for hit in hits {
                    results_block.push_str("- ");
                    results_block.push_str(&hit.line);
                    results_block.push('\n');
                }
            }
            Err(_) => results_block.push_str("(tool unavailable)\n"),
        }
        results_block.push('\n');
    }

    format!(
        r"The user asked:
==================
{user_query}

Your draft reply (tool markers removed before display):
==================
{draft}

Tool results:
==================
{results_block}
Write one coherent reply that answers the user, folding in what the tool
results add. Do not mention tools, markers or drafts. Do not emit new tool
markers."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::exchange::ExchangeSource;
    use memory_pipeline::PipelineConfig;
    use uuid::Uuid;

    async fn setup_ctx() -> ToolContext {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(16).await.expect("init");
        let embedder = Arc::new(EmbeddingClient::hashed(16).expect("embedder"));
        let pipeline =
            MemoryPipeline::start(Arc::clone(&db), Arc::clone(&embedder), PipelineConfig::default());

        ToolContext {
            db,
            pipeline,
            embedder,
            scope: MemoryScope::for_user("u1"),
            session_id: "s1".to_string(),
            tuning: RetrievalTuning {
                process_min_score: 0.1,
                ..RetrievalTuning::default()
            },
        }
    }

    async fn seed(ctx: &ToolContext, human: &str, assistant: &str) -> String {
        let exchange = Exchange::new(
            ctx.session_id.clone(),
            Some("u1".into()),
            None,
            human.into(),
            assistant.into(),
            ExchangeSource::Chat,
        );
        let embedding = ctx
            .embedder
            .embed(&format!("{human}\n{assistant}"))
            .await
            .expect("embed");
        let id = Exchange::record(exchange, Some(embedding), &ctx.db)
            .await
            .expect("record");
        ctx.db.rebuild_indexes().await.expect("rebuild");
        id
    }

    #[tokio::test]
    async fn grep_and_vector_run_and_sections_stay_in_kind_order() {
        let ctx = setup_ctx().await;
        seed(&ctx, "vitamins are important", "yes, especially B12").await;

        let calls = vec![
            ToolCall::Vector {
                query: "vitamins".into(),
            },
            ToolCall::Grep {
                term: "vitamins".into(),
            },
        ];

        let outcome = execute_tools(&ctx, calls, &CancellationToken::new())
            .await
            .expect("execute");

        assert_eq!(outcome.sections.len(), 2);
        assert_eq!(outcome.sections[0].kind, ToolKind::Grep);
        assert_eq!(outcome.sections[1].kind, ToolKind::Vector);
        assert!(outcome.has_results());
        assert_eq!(outcome.tools_used(), vec!["GREP", "VECTOR"]);
    }

    #[tokio::test]
    async fn dense_lanes_never_repeat_grep_ids() {
        let ctx = setup_ctx().await;
        let id = seed(&ctx, "vitamins are important", "yes, especially B12").await;

        let outcome = execute_tools(
            &ctx,
            vec![
                ToolCall::Grep {
                    term: "vitamins".into(),
                },
                ToolCall::Vector {
                    query: "vitamins are important".into(),
                },
            ],
            &CancellationToken::new(),
        )
        .await
        .expect("execute");

        let grep = &outcome.sections[0];
        let vector = &outcome.sections[1];
        let grep_hits = grep.result.as_ref().expect("grep ok");
        assert!(grep_hits.iter().any(|hit| hit.exchange_id.as_deref() == Some(id.as_str())));

        let vector_hits = vector.result.as_ref().expect("vector ok");
        assert!(
            vector_hits
                .iter()
                .all(|hit| hit.exchange_id.as_deref() != Some(id.as_str())),
            "VECTOR must not repeat ids GREP already reported"
        );
    }

    #[tokio::test]
    async fn squirrel_recalls_recent_window() {
        let ctx = setup_ctx().await;
        seed(&ctx, "just now", "fresh reply").await;

        let outcome = execute_tools(
            &ctx,
            vec![ToolCall::Squirrel {
                timeframe: Some("-60min".into()),
                back: Some(5),
                search: None,
            }],
            &CancellationToken::new(),
        )
        .await
        .expect("execute");

        let hits = outcome.sections[0].result.as_ref().expect("squirrel ok");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].line.contains("just now"));
    }

    #[tokio::test]
    async fn bad_timeframe_fails_only_that_tool() {
        let ctx = setup_ctx().await;
        seed(&ctx, "vitamins", "noted").await;

        let outcome = execute_tools(
            &ctx,
            vec![
                ToolCall::Squirrel {
                    timeframe: Some("whenever".into()),
                    back: None,
                    search: None,
                },
                ToolCall::Grep {
                    term: "vitamins".into(),
                },
            ],
            &CancellationToken::new(),
        )
        .await
        .expect("execute");

        let squirrel = outcome
            .sections
            .iter()
            .find(|s| s.kind == ToolKind::Squirrel)
            .expect("squirrel section");
        assert!(squirrel.result.is_err());
        let grep = outcome
            .sections
            .iter()
            .find(|s| s.kind == ToolKind::Grep)
            .expect("grep section");
        assert!(grep.result.is_ok());
        assert!(outcome.has_results());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_execution() {
        let ctx = setup_ctx().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = execute_tools(
            &ctx,
            vec![ToolCall::Grep {
                term: "anything".into(),
            }],
            &cancel,
        )
        .await;

        assert!(result.is_err());
    }

    #[test]
    fn synthesis_prompt_is_deterministic_and_labels_failures() {
        let outcome = ToolOutcome {
            sections: vec![
                ToolSection {
                    kind: ToolKind::Grep,
                    result: Ok(vec![ToolHit {
                        exchange_id: Some("e1".into()),
                        line: "(2025-01-01 10:00) user: hi | assistant: hello".into(),
                    }]),
                    latency_ms: 3,
                },
                ToolSection {
                    kind: ToolKind::Vector,
                    result: Err(AppError::ToolExecution("boom".into())),
                    latency_ms: 5,
                },
            ],
        };

        let prompt = synthesis_prompt("what do we know?", "draft text", &outcome);
        assert!(prompt.contains("### GREP"));
        assert!(prompt.contains("### VECTOR"));
        assert!(prompt.contains("(tool unavailable)"));
        let grep_at = prompt.find("### GREP").expect("grep");
        let vector_at = prompt.find("### VECTOR").expect("vector");
        assert!(grep_at < vector_at, "sections joined in fixed kind order");
    }
}
