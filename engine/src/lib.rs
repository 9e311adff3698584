pub mod actions;
pub mod phase;
pub mod prompt;
pub mod registry;
pub mod tools;
pub mod twin;

pub use registry::TwinRegistry;
pub use twin::{CognitiveState, EngineDeps, EngineTimeouts, ThinkChunk, Twin, TurnRequest};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use common::error::AppError;
    use common::scope::MemoryScope;
    use common::storage::db::SurrealDbClient;
    use common::storage::types::exchange::{Exchange, ExchangeSource};
    use common::storage::types::tenant_config::TenantConfig;
    use common::utils::embedding::EmbeddingClient;
    use common::utils::llm::{ScriptedModel, ScriptedReply};
    use memory_pipeline::{MemoryPipeline, PipelineConfig};

    use super::twin::{PersonalTwin, ThinkChunk, Twin, TurnRequest};
    use super::{EngineDeps, EngineTimeouts};

    struct Harness {
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingClient>,
        pipeline: Arc<MemoryPipeline>,
        lm: Arc<ScriptedModel>,
        twin: PersonalTwin,
    }

    async fn harness(replies: Vec<ScriptedReply>) -> Harness {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(16).await.expect("init");

        let embedder = Arc::new(EmbeddingClient::hashed(16).expect("embedder"));
        let pipeline = MemoryPipeline::start(
            Arc::clone(&db),
            Arc::clone(&embedder),
            PipelineConfig {
                batch_max: 1,
                flush_interval: Duration::from_millis(50),
                cluster_tau: 0.83,
            },
        );
        let lm = Arc::new(ScriptedModel::new(replies));

        let deps = EngineDeps {
            db: Arc::clone(&db),
            lm: Arc::clone(&lm) as Arc<dyn common::utils::llm::LanguageModel>,
            embedder: Arc::clone(&embedder),
            pipeline: Arc::clone(&pipeline),
        };
        let twin = PersonalTwin::new(
            deps,
            TenantConfig::defaults_for("default"),
            EngineTimeouts::default(),
        );

        Harness {
            db,
            embedder,
            pipeline,
            lm,
            twin,
        }
    }

    fn request(session: &str, input: &str, scope: MemoryScope) -> TurnRequest {
        TurnRequest {
            session_id: session.to_string(),
            input: input.to_string(),
            scope,
            cancel: CancellationToken::new(),
        }
    }

    async fn collect(mut rx: tokio::sync::mpsc::Receiver<ThinkChunk>) -> Vec<ThinkChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    fn content_of(chunks: &[ThinkChunk]) -> String {
        chunks
            .iter()
            .filter_map(|chunk| match chunk {
                ThinkChunk::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_exchanges(db: &SurrealDbClient, scope: &MemoryScope, count: usize) -> Vec<Exchange> {
        for _ in 0..100 {
            let rows = Exchange::recent(scope, None, None, 20, db).await.expect("recent");
            if rows.len() >= count {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {count} exchanges");
    }

    #[tokio::test]
    async fn empty_scope_is_rejected_before_any_work() {
        let h = harness(vec![ScriptedReply::text("should never run")]).await;

        let result = h
            .twin
            .think(request("s1", "hello", MemoryScope::default()))
            .await;
        assert!(matches!(result, Err(AppError::Scope(_))));
        assert!(h.lm.stream_requests().is_empty(), "no LLM call without scope");

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn plain_turn_streams_and_ingests() {
        let h = harness(vec![ScriptedReply::chunks(&["Hello ", "there."])]).await;
        let scope = MemoryScope::for_user("u1");

        let rx = h
            .twin
            .think(request("s1", "greetings", scope.clone()))
            .await
            .expect("think");
        let chunks = collect(rx).await;

        assert_eq!(content_of(&chunks), "Hello there.");
        assert!(chunks
            .iter()
            .any(|c| matches!(c, ThinkChunk::Meta(state) if state.tools_used.is_empty())));

        let rows = wait_for_exchanges(&h.db, &scope, 1).await;
        assert_eq!(rows[0].human_content, "greetings");
        assert_eq!(rows[0].assistant_content, "Hello there.");
        assert!(!rows[0].flags.partial);

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn second_turn_sees_the_first_through_the_session_buffer() {
        let h = harness(vec![
            ScriptedReply::text("Noted: indigo it is."),
            ScriptedReply::text("You mentioned indigo."),
        ])
        .await;
        let scope = MemoryScope::for_user("u1");

        let rx = h
            .twin
            .think(request("s1", "my favorite color is indigo", scope.clone()))
            .await
            .expect("turn one");
        collect(rx).await;
        wait_for_exchanges(&h.db, &scope, 1).await;

        let rx = h
            .twin
            .think(request("s1", "what color did I mention?", scope.clone()))
            .await
            .expect("turn two");
        let chunks = collect(rx).await;
        assert!(content_of(&chunks).contains("indigo"));

        // The retrieved first turn must have reached the second prompt.
        let requests = h.lm.stream_requests();
        assert_eq!(requests.len(), 2);
        assert!(
            requests[1].system.contains("indigo"),
            "prior exchange missing from system prompt: {}",
            requests[1].system
        );

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn tool_markers_fan_out_and_synthesize_once() {
        let h = harness(vec![
            ScriptedReply::chunks(&[
                "Let me look that up. ",
                r#"[GREP term="vitamins"] [VECTOR query="nutrition"]"#,
            ]),
            ScriptedReply::text("Vitamins matter, and our notes on nutrition agree."),
        ])
        .await;
        let scope = MemoryScope::for_user("u1");

        // Seed memory for the tools to find.
        for (human, assistant) in [
            ("tell me about vitamins", "vitamin B12 supports nerves"),
            ("nutrition basics", "a balanced diet covers most needs"),
        ] {
            let exchange = Exchange::new(
                "old-session".into(),
                Some("u1".into()),
                None,
                human.into(),
                assistant.into(),
                ExchangeSource::Chat,
            );
            let embedding = h
                .embedder
                .embed(&format!("{human}\n{assistant}"))
                .await
                .expect("embed");
            Exchange::record(exchange, Some(embedding), &h.db)
                .await
                .expect("record");
        }
        h.db.rebuild_indexes().await.expect("rebuild");

        let rx = h
            .twin
            .think(request(
                "s1",
                "what do we know about vitamins and nutrition?",
                scope.clone(),
            ))
            .await
            .expect("think");
        let chunks = collect(rx).await;

        // Markers are stripped from what the user sees.
        let content = content_of(&chunks);
        assert!(!content.contains("[GREP"));
        assert!(content.contains("Vitamins matter"));

        // Exactly one synthesis call, whatever the marker count.
        assert_eq!(h.lm.completion_requests().len(), 1);

        let meta = chunks
            .iter()
            .find_map(|c| match c {
                ThinkChunk::Meta(state) if !state.tools_used.is_empty() => Some(state.clone()),
                _ => None,
            })
            .expect("cognitive state with tools");
        assert_eq!(meta.tools_used, vec!["GREP", "VECTOR"]);

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn tools_without_results_skip_the_synthesis_call() {
        let h = harness(vec![ScriptedReply::text(
            r#"Nothing stored. [GREP term="xyzzy-never-mentioned"]"#,
        )])
        .await;
        let scope = MemoryScope::for_user("u1");

        let rx = h
            .twin
            .think(request("s1", "do you remember xyzzy?", scope))
            .await
            .expect("think");
        collect(rx).await;

        assert!(
            h.lm.completion_requests().is_empty(),
            "synthesis must not run when no tool produced results"
        );

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn cancellation_ingests_a_partial_exchange() {
        let h = harness(vec![ScriptedReply::hanging(&["partial answer so far"])]).await;
        let scope = MemoryScope::for_user("u1");

        let cancel = CancellationToken::new();
        let mut turn = request("s1", "tell me everything", scope.clone());
        turn.cancel = cancel.clone();

        let mut rx = h.twin.think(turn).await.expect("think");

        // First chunk arrives, then the stream hangs; cancel mid-turn.
        let first = rx.recv().await.expect("first chunk");
        assert!(matches!(first, ThinkChunk::Content(_)));
        cancel.cancel();

        // Channel must close promptly after cancellation.
        let closed = tokio::time::timeout(Duration::from_millis(200), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "turn did not unwind within 200ms");

        let rows = wait_for_exchanges(&h.db, &scope, 1).await;
        assert!(rows[0].flags.partial, "cut-short turn must be flagged partial");
        assert_eq!(rows[0].assistant_content, "partial answer so far");

        h.pipeline.stop().await;
    }

    #[tokio::test]
    async fn action_tags_mark_the_exchange() {
        let h = harness(vec![ScriptedReply::text(
            r#"Escalating now. [ESCALATE reason="billing dispute"]"#,
        )])
        .await;
        let scope = MemoryScope::for_user("u1");

        let rx = h
            .twin
            .think(request("s1", "my invoice is wrong", scope.clone()))
            .await
            .expect("think");
        let chunks = collect(rx).await;
        assert!(!content_of(&chunks).contains("[ESCALATE"));

        let rows = wait_for_exchanges(&h.db, &scope, 1).await;
        assert!(rows[0].flags.action_required);
        assert!(rows[0].tags.values().any(|v| v == "billing dispute"));

        h.pipeline.stop().await;
    }
}
